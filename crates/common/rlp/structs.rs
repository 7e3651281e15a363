use super::{
    decode::{RLPDecode, decode_rlp_item, get_item_with_prefix},
    encode::{RLPEncode, encode_length},
    error::RLPDecodeError,
};
use bytes::BufMut;

/// # Struct decoding helper
///
/// Decodes a struct from an RLP list, field by field, in the order the
/// fields are passed to [`Decoder::decode_field`]. Every field type must
/// implement [`RLPDecode`].
///
/// ```rust
/// # use ethwire_rlp::structs::Decoder;
/// # use ethwire_rlp::error::RLPDecodeError;
/// # use ethwire_rlp::decode::RLPDecode;
/// #[derive(Debug, PartialEq, Eq)]
/// struct Simple {
///     pub a: u8,
///     pub b: u16,
/// }
///
/// impl RLPDecode for Simple {
///     fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), RLPDecodeError> {
///         let decoder = Decoder::new(buf)?;
///         let (a, decoder) = decoder.decode_field("a")?;
///         let (b, decoder) = decoder.decode_field("b")?;
///         let rest = decoder.finish()?;
///         Ok((Simple { a, b }, rest))
///     }
/// }
///
/// let bytes = [0xc2, 61, 75];
/// assert_eq!(Simple::decode(&bytes).unwrap(), Simple { a: 61, b: 75 });
/// ```
#[derive(Debug)]
#[must_use = "`Decoder` must be consumed with `finish` to perform decoding checks"]
pub struct Decoder<'a> {
    payload: &'a [u8],
    remaining: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Result<Self, RLPDecodeError> {
        match decode_rlp_item(buf)? {
            (true, payload, remaining) => Ok(Self { payload, remaining }),
            (false, _, _) => Err(RLPDecodeError::UnexpectedString),
        }
    }

    pub fn decode_field<T: RLPDecode>(self, name: &str) -> Result<(T, Self), RLPDecodeError> {
        let (field, rest) = <T as RLPDecode>::decode_unfinished(self.payload)
            .map_err(|err| field_decode_error::<T>(name, err))?;
        Ok((
            field,
            Self {
                payload: rest,
                ..self
            },
        ))
    }

    /// Returns `Some(field)` if there is a decodable field left, `None`
    /// otherwise. Used for optional trailing fields.
    pub fn decode_optional_field<T: RLPDecode>(self) -> (Option<T>, Self) {
        match <T as RLPDecode>::decode_unfinished(self.payload) {
            Ok((field, rest)) => (
                Some(field),
                Self {
                    payload: rest,
                    ..self
                },
            ),
            Err(_) => (None, self),
        }
    }

    /// Returns the next field without decoding it, prefix included.
    pub fn get_encoded_item(self) -> Result<(Vec<u8>, Self), RLPDecodeError> {
        let (field, rest) = get_item_with_prefix(self.payload)?;
        Ok((
            field.to_vec(),
            Self {
                payload: rest,
                ..self
            },
        ))
    }

    /// Finishes decoding and returns the bytes after the list.
    /// Errors if the list payload was not fully consumed.
    pub const fn finish(self) -> Result<&'a [u8], RLPDecodeError> {
        if self.payload.is_empty() {
            Ok(self.remaining)
        } else {
            Err(RLPDecodeError::MalformedData)
        }
    }

    /// Same as [`finish`](Self::finish) but ignores unconsumed payload.
    /// Needed where the spec says additional list elements must be ignored.
    pub const fn finish_unchecked(self) -> &'a [u8] {
        self.remaining
    }

    pub const fn is_done(&self) -> bool {
        self.payload.is_empty()
    }
}

fn field_decode_error<T>(field_name: &str, err: RLPDecodeError) -> RLPDecodeError {
    let typ = std::any::type_name::<T>();
    RLPDecodeError::Custom(format!(
        "Error decoding field '{field_name}' of type {typ}: {err}"
    ))
}

/// # Struct encoding helper
///
/// Encodes a struct as an RLP list, field by field, in the order the fields
/// are passed to [`Encoder::encode_field`].
///
/// ```rust
/// # use ethwire_rlp::structs::Encoder;
/// # use ethwire_rlp::encode::RLPEncode;
/// # use bytes::BufMut;
/// struct Simple {
///     pub a: u8,
///     pub b: u16,
/// }
///
/// impl RLPEncode for Simple {
///     fn encode(&self, buf: &mut dyn BufMut) {
///         Encoder::new(buf)
///             .encode_field(&self.a)
///             .encode_field(&self.b)
///             .finish();
///     }
/// }
///
/// let mut buf = vec![];
/// Simple { a: 61, b: 75 }.encode(&mut buf);
/// assert_eq!(&buf, &[0xc2, 61, 75]);
/// ```
#[must_use = "`Encoder` must be consumed with `finish` to perform the encoding"]
pub struct Encoder<'a> {
    buf: &'a mut dyn BufMut,
    temp_buf: Vec<u8>,
}

impl<'a> Encoder<'a> {
    pub fn new(buf: &'a mut dyn BufMut) -> Self {
        Self {
            buf,
            temp_buf: Vec::new(),
        }
    }

    pub fn encode_field<T: RLPEncode>(mut self, value: &T) -> Self {
        <T as RLPEncode>::encode(value, &mut self.temp_buf);
        self
    }

    /// If `Some`, stores a field to be encoded, else does nothing.
    pub fn encode_optional_field<T: RLPEncode>(mut self, opt_value: &Option<T>) -> Self {
        if let Some(value) = opt_value {
            <T as RLPEncode>::encode(value, &mut self.temp_buf);
        }
        self
    }

    /// Stores a field to be encoded as a byte string. Bypasses the
    /// conflicting list interpretation of `Vec<u8>`.
    pub fn encode_bytes(mut self, value: &[u8]) -> Self {
        <[u8] as RLPEncode>::encode(value, &mut self.temp_buf);
        self
    }

    /// Appends raw, already-encoded bytes without re-encoding them.
    pub fn encode_raw(mut self, value: &[u8]) -> Self {
        self.temp_buf.put_slice(value);
        self
    }

    /// Writes the list prefix and the accumulated fields to the buffer.
    pub fn finish(self) {
        encode_length(self.temp_buf.len(), self.buf);
        self.buf.put_slice(&self.temp_buf);
    }
}

impl core::fmt::Debug for Encoder<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Encoder")
            .field("buf", &"...")
            .field("temp_buf", &self.temp_buf)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{decode::RLPDecode, encode::RLPEncode};

    #[derive(Debug, PartialEq, Eq)]
    struct Simple {
        pub a: u8,
        pub b: u16,
    }

    #[test]
    fn encoder_matches_tuple_encoding() {
        let input = Simple { a: 61, b: 75 };
        let mut buf = Vec::new();
        Encoder::new(&mut buf)
            .encode_field(&input.a)
            .encode_field(&input.b)
            .finish();
        assert_eq!(buf, vec![0xc2, 61, 75]);

        let mut tuple_encoded = Vec::new();
        (input.a, input.b).encode(&mut tuple_encoded);
        assert_eq!(buf, tuple_encoded);
    }

    #[test]
    fn decoder_roundtrip() {
        let mut buf = Vec::new();
        Encoder::new(&mut buf)
            .encode_field(&61u8)
            .encode_field(&75u16)
            .finish();

        let decoder = Decoder::new(&buf).unwrap();
        let (a, decoder) = decoder.decode_field::<u8>("a").unwrap();
        let (b, decoder) = decoder.decode_field::<u16>("b").unwrap();
        let rest = decoder.finish().unwrap();
        assert!(rest.is_empty());
        assert_eq!(Simple { a, b }, Simple { a: 61, b: 75 });
    }

    #[test]
    fn decoder_optional_trailing_field() {
        let mut buf = Vec::new();
        Encoder::new(&mut buf).encode_field(&1u8).finish();

        let decoder = Decoder::new(&buf).unwrap();
        let (first, decoder) = decoder.decode_field::<u8>("first").unwrap();
        let (missing, decoder) = decoder.decode_optional_field::<u8>();
        assert_eq!(first, 1);
        assert_eq!(missing, None);
        assert!(decoder.finish().unwrap().is_empty());
    }

    #[test]
    fn decoder_rejects_unconsumed_payload() {
        let mut buf = Vec::new();
        Encoder::new(&mut buf)
            .encode_field(&1u8)
            .encode_field(&2u8)
            .finish();

        let decoder = Decoder::new(&buf).unwrap();
        let (_, decoder) = decoder.decode_field::<u8>("first").unwrap();
        assert!(decoder.finish().is_err());
    }
}
