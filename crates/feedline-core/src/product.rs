use std::fmt;

use serde::{Deserialize, Serialize};

use crate::feedtype::Feedtype;
use crate::signature::Signature;
use crate::time::Timestamp;

/// Metadata describing one data product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductInfo {
    /// Time the product entered the origin's store.
    pub arrival: Timestamp,
    pub signature: Signature,
    /// Host that first injected the product.
    pub origin: String,
    pub feedtype: Feedtype,
    pub seqno: u32,
    /// Identifier text matched against subscription patterns.
    pub ident: String,
    /// Payload size in bytes.
    pub size: u32,
}

impl fmt::Display for ProductInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:>8} {} {} {:>3} {}",
            self.size, self.arrival, self.feedtype, self.seqno, self.ident
        )
    }
}

/// A product: metadata plus payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub info: ProductInfo,
    pub data: Vec<u8>,
}

impl Product {
    /// Builds a product whose signature and size are derived from `data`.
    pub fn new(
        feedtype: Feedtype,
        ident: impl Into<String>,
        origin: impl Into<String>,
        seqno: u32,
        arrival: Timestamp,
        data: Vec<u8>,
    ) -> Self {
        let size = u32::try_from(data.len()).unwrap_or(u32::MAX);
        Self {
            info: ProductInfo {
                arrival,
                signature: Signature::of(&data),
                origin: origin.into(),
                feedtype,
                seqno,
                ident: ident.into(),
                size,
            },
            data,
        }
    }

    /// Whether the payload agrees with the size and signature in the metadata.
    pub fn is_consistent(&self) -> bool {
        self.data.len() == self.info.size as usize && Signature::of(&self.data) == self.info.signature
    }
}

#[cfg(test)]
mod tests {
    use super::Product;
    use crate::feedtype::Feedtype;
    use crate::time::Timestamp;

    #[test]
    fn new_product_derives_size_and_signature() {
        let product = Product::new(
            Feedtype(8),
            "SAUS43 KWBC",
            "origin.example",
            1,
            Timestamp::from_secs(100),
            b"payload".to_vec(),
        );
        assert_eq!(product.info.size, 7);
        assert!(product.is_consistent());

        let mut tampered = product.clone();
        tampered.data[0] ^= 0xff;
        assert!(!tampered.is_consistent());
    }
}
