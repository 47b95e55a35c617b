use serde::de::{self, Deserialize, Deserializer, SeqAccess, Visitor};
use serde::ser::{Serialize, SerializeTuple, Serializer};
use std::fmt;

// Fixed byte arrays that travel over the wire as a one-element tuple holding
// a hex string, e.g. `["00ff.."]`.
macro_rules! fixed_size_array {
    ($name:ident, $len:expr) => {
        #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            pub fn from_slice(buf: &[u8]) -> Option<Self> {
                if buf.len() != $len {
                    return None;
                }
                let mut b = [0u8; $len];
                b.copy_from_slice(buf);
                Some($name(b))
            }

            pub fn from_hex(s: &str) -> Result<Self, String> {
                let bytes = hex::decode(s).map_err(|e| e.to_string())?;
                Self::from_slice(&bytes).ok_or_else(|| {
                    format!("invalid length: expected {} bytes, got {}", $len, bytes.len())
                })
            }

            pub fn to_hex(&self) -> String {
                hex::encode(&self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
                let mut tup = s.serialize_tuple(1)?;
                tup.serialize_element(&self.to_hex())?;
                tup.end()
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                struct ArrayVisitor;
                impl<'de> Visitor<'de> for ArrayVisitor {
                    type Value = $name;

                    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                        formatter.write_str(concat!("struct ", stringify!($name)))
                    }

                    #[inline]
                    fn visit_seq<V>(self, mut seq: V) -> Result<$name, V::Error>
                    where
                        V: SeqAccess<'de>,
                    {
                        let hex_str = match seq.next_element::<String>()? {
                            Some(s) => s,
                            None => return Err(de::Error::custom("No string was found")),
                        };
                        $name::from_hex(&hex_str).map_err(de::Error::custom)
                    }
                }
                deserializer.deserialize_tuple(1, ArrayVisitor)
            }
        }
    };
}

fixed_size_array!(FixedSizeArray16, 16);
fixed_size_array!(FixedSizeArray32, 32);

#[derive(Copy, Clone, PartialEq, Eq)]
pub struct FixedSizeArray64(pub [u8; 32], pub [u8; 32]);

impl FixedSizeArray64 {
    pub fn new(buf: [u8; 64]) -> Self {
        let mut b1 = [0u8; 32];
        let mut b2 = [0u8; 32];
        b1.copy_from_slice(&buf[0..32]);
        b2.copy_from_slice(&buf[32..64]);
        FixedSizeArray64(b1, b2)
    }

    pub fn get_bytes(&self) -> Vec<u8> {
        let mut b = Vec::with_capacity(64);
        b.extend_from_slice(&self.0);
        b.extend_from_slice(&self.1);
        b
    }
}

impl Default for FixedSizeArray64 {
    fn default() -> Self {
        FixedSizeArray64([0u8; 32], [0u8; 32])
    }
}

// key material: keep it out of debug output
impl fmt::Debug for FixedSizeArray64 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "FixedSizeArray64(..)")
    }
}

impl Serialize for FixedSizeArray64 {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let mut tup = s.serialize_tuple(1)?;
        tup.serialize_element(&hex::encode(&self.get_bytes()))?;
        tup.end()
    }
}

impl<'de> Deserialize<'de> for FixedSizeArray64 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct FixedSizeArray64Visitor;
        impl<'de> Visitor<'de> for FixedSizeArray64Visitor {
            type Value = FixedSizeArray64;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("struct FixedSizeArray64")
            }

            #[inline]
            fn visit_seq<V>(self, mut seq: V) -> Result<FixedSizeArray64, V::Error>
            where
                V: SeqAccess<'de>,
            {
                let hex_str = match seq.next_element::<String>()? {
                    Some(s) => s,
                    None => return Err(de::Error::custom("No string was found")),
                };
                let b = hex::decode(&hex_str).map_err(|_| de::Error::custom("invalid hex encoding"))?;
                if b.len() != 64 {
                    return Err(de::Error::custom("invalid length: expected 64 bytes"));
                }
                let mut buf = [0u8; 64];
                buf.copy_from_slice(&b);
                Ok(FixedSizeArray64::new(buf))
            }
        }
        deserializer.deserialize_tuple(1, FixedSizeArray64Visitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_size_arrays_serialize_as_hex() {
        let a = FixedSizeArray16([0xab; 16]);
        let ser = serde_json::to_string(&a).unwrap();
        assert_eq!(ser, format!("[\"{}\"]", "ab".repeat(16)));

        let b: FixedSizeArray16 = serde_json::from_str(&ser).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn fixed_size_arrays_reject_bad_input() {
        let short = format!("[\"{}\"]", "00".repeat(31));
        assert!(serde_json::from_str::<FixedSizeArray32>(&short).is_err());
        assert!(serde_json::from_str::<FixedSizeArray32>("[\"zz\"]").is_err());

        let wrong = format!("[\"{}\"]", "11".repeat(63));
        assert!(serde_json::from_str::<FixedSizeArray64>(&wrong).is_err());
    }

    #[test]
    fn fixed_size_array64_splits_halves() {
        let mut buf = [0u8; 64];
        buf[..32].copy_from_slice(&[1u8; 32]);
        buf[32..].copy_from_slice(&[2u8; 32]);
        let k = FixedSizeArray64::new(buf);
        assert_eq!(k.0, [1u8; 32]);
        assert_eq!(k.1, [2u8; 32]);
        assert_eq!(k.get_bytes(), buf.to_vec());
    }
}
