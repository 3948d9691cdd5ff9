use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Length in bytes of a product signature.
pub const SIGNATURE_LEN: usize = 16;

/// 16-byte product signature used for duplicate detection and resumption.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Signature(pub [u8; SIGNATURE_LEN]);

impl Signature {
    /// Derives a signature from product bytes (truncated BLAKE3).
    pub fn of(data: &[u8]) -> Self {
        let digest = blake3::hash(data);
        let mut bytes = [0_u8; SIGNATURE_LEN];
        bytes.copy_from_slice(&digest.as_bytes()[..SIGNATURE_LEN]);
        Self(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for Signature {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0_u8; SIGNATURE_LEN];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

impl Serialize for Signature {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = <serde_bytes_buf::ByteBuf>::deserialize(deserializer)?;
        if raw.0.len() != SIGNATURE_LEN {
            return Err(serde::de::Error::invalid_length(
                raw.0.len(),
                &"exactly 16 bytes",
            ));
        }
        let mut bytes = [0_u8; SIGNATURE_LEN];
        bytes.copy_from_slice(&raw.0);
        Ok(Self(bytes))
    }
}

mod serde_bytes_buf {
    use std::fmt;

    use serde::de::{self, Deserialize, Deserializer, SeqAccess, Visitor};

    /// Accepts either a byte string or a sequence of integers.
    pub struct ByteBuf(pub Vec<u8>);

    impl<'de> Deserialize<'de> for ByteBuf {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            struct BufVisitor;

            impl<'de> Visitor<'de> for BufVisitor {
                type Value = ByteBuf;

                fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                    formatter.write_str("a byte string")
                }

                fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
                where
                    E: de::Error,
                {
                    Ok(ByteBuf(v.to_vec()))
                }

                fn visit_byte_buf<E>(self, v: Vec<u8>) -> Result<Self::Value, E>
                where
                    E: de::Error,
                {
                    Ok(ByteBuf(v))
                }

                fn visit_seq<S>(self, mut seq: S) -> Result<Self::Value, S::Error>
                where
                    S: SeqAccess<'de>,
                {
                    let mut out = Vec::new();
                    while let Some(byte) = seq.next_element()? {
                        out.push(byte);
                    }
                    Ok(ByteBuf(out))
                }
            }

            deserializer.deserialize_byte_buf(BufVisitor)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Signature;

    #[test]
    fn signature_is_deterministic() {
        assert_eq!(Signature::of(b"product"), Signature::of(b"product"));
        assert_ne!(Signature::of(b"product-a"), Signature::of(b"product-b"));
    }

    #[test]
    fn hex_text_parses_back() {
        let sig = Signature::of(b"feed");
        let text = sig.to_string();
        assert_eq!(text.len(), 32);
        assert_eq!(text.parse::<Signature>().expect("hex"), sig);
        assert!("abcd".parse::<Signature>().is_err());
    }

    #[test]
    fn cbor_encoding_rejects_wrong_length() {
        let sig = Signature([7_u8; 16]);
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&sig, &mut bytes).expect("encode");
        let back: Signature = ciborium::de::from_reader(bytes.as_slice()).expect("decode");
        assert_eq!(back, sig);

        let mut short = Vec::new();
        ciborium::ser::into_writer(&ciborium::Value::Bytes(vec![1, 2, 3]), &mut short)
            .expect("encode");
        assert!(ciborium::de::from_reader::<Signature, _>(short.as_slice()).is_err());
    }
}
