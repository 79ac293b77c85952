//! Product and SoM attestation descriptors.
//!
//! A descriptor file is a UTF-8 JSON dictionary exported by the key request
//! portal. Exactly one of the permanent attribute (product mode) or the SoM
//! id (SoM mode) is present; loading one mode clears the other.

use crate::error::{Error, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::{fs, path::Path, sync::Mutex};

const JSON_PRODUCT_NAME: &str = "productName";
const JSON_PRODUCT_ATTRIBUTE: &str = "productPermanentAttribute";
const JSON_VBOOT_KEY: &str = "bootloaderPublicKey";
const JSON_SOM_ID: &str = "somId";

/// The permanent attribute blob is always exactly this long.
pub const EXPECTED_ATTRIBUTE_LENGTH: usize = 1052;
/// The product id is the last 16 bytes of the permanent attribute.
const PRODUCT_ID_LENGTH: usize = 16;

/// A selected product identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProductInfo {
    /// Lowercase hex of the last 16 attribute bytes.
    pub product_id: String,
    pub product_name: String,
    pub product_attributes: Vec<u8>,
    pub vboot_key: Vec<u8>,
}

/// A selected SoM identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SomInfo {
    pub som_id: String,
    pub som_name: String,
    pub vboot_key: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Descriptor {
    Product(ProductInfo),
    Som(SomInfo),
}

/// Parse a descriptor document.
pub fn parse_descriptor(content: &str) -> Result<Descriptor> {
    let value: serde_json::Value = serde_json::from_str(content)
        .map_err(|_| Error::DescriptorFormat("Wrong JSON format!".into()))?;

    let name = value
        .get(JSON_PRODUCT_NAME)
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    let attribute = value.get(JSON_PRODUCT_ATTRIBUTE).and_then(|v| v.as_str());
    let som_id = value.get(JSON_SOM_ID).and_then(|v| v.as_str());
    let vboot_key = value
        .get(JSON_VBOOT_KEY)
        .and_then(|v| v.as_str())
        .unwrap_or_default();

    if name.is_empty() || vboot_key.is_empty() || (attribute.is_none() && som_id.is_none()) {
        return Err(Error::DescriptorFormat("Essential field missing!".into()));
    }
    if attribute.is_some() && som_id.is_some() {
        return Err(Error::DescriptorFormat(
            "Both product attribute and SoM id present".into(),
        ));
    }

    let vboot_key = BASE64.decode(vboot_key).map_err(|_| {
        Error::DescriptorFormat("Incorrect Base64 encoding for verified boot key".into())
    })?;

    match attribute {
        Some(attribute) => {
            let attribute = BASE64.decode(attribute).map_err(|_| {
                Error::DescriptorFormat(
                    "Incorrect Base64 encoding for permanent product attributes".into(),
                )
            })?;
            if attribute.len() != EXPECTED_ATTRIBUTE_LENGTH {
                return Err(Error::DescriptorFormat(
                    "Incorrect permanent product attributes length".into(),
                ));
            }
            let product_id = hex::encode(&attribute[attribute.len() - PRODUCT_ID_LENGTH..]);
            Ok(Descriptor::Product(ProductInfo {
                product_id,
                product_name: name.to_string(),
                product_attributes: attribute,
                vboot_key,
            }))
        }
        None => Ok(Descriptor::Som(SomInfo {
            som_id: som_id.unwrap_or_default().to_string(),
            som_name: name.to_string(),
            vboot_key,
        })),
    }
}

/// Holds the one currently selected descriptor.
#[derive(Default)]
pub struct DescriptorStore {
    inner: Mutex<Option<Descriptor>>,
}

impl DescriptorStore {
    /// Load a descriptor file, replacing whatever mode was active.
    pub fn load_file(&self, path: &Path) -> Result<Descriptor> {
        let content = fs::read_to_string(path)?;
        let descriptor = parse_descriptor(&content)?;
        *self.inner.lock().expect("descriptor store") = Some(descriptor.clone());
        Ok(descriptor)
    }

    pub fn set(&self, descriptor: Descriptor) {
        *self.inner.lock().expect("descriptor store") = Some(descriptor);
    }

    pub fn current(&self) -> Option<Descriptor> {
        self.inner.lock().expect("descriptor store").clone()
    }

    pub fn product(&self) -> Option<ProductInfo> {
        match self.current() {
            Some(Descriptor::Product(info)) => Some(info),
            _ => None,
        }
    }

    pub fn som(&self) -> Option<SomInfo> {
        match self.current() {
            Some(Descriptor::Som(info)) => Some(info),
            _ => None,
        }
    }

    /// Whether the selected mode is SoM.
    pub fn is_som(&self) -> bool {
        matches!(self.current(), Some(Descriptor::Som(_)))
    }

    /// The verified boot key for whichever mode is selected.
    pub fn vboot_key(&self) -> Result<Vec<u8>> {
        match self.current() {
            Some(Descriptor::Product(info)) => Ok(info.vboot_key),
            Some(Descriptor::Som(info)) => Ok(info.vboot_key),
            None => Err(Error::ProductNotSpecified),
        }
    }

    /// The product or SoM identifier used by appliance key queries.
    pub fn key_id(&self) -> Result<String> {
        match self.current() {
            Some(Descriptor::Product(info)) => Ok(info.product_id),
            Some(Descriptor::Som(info)) => Ok(info.som_id),
            None => Err(Error::ProductNotSpecified),
        }
    }
}
