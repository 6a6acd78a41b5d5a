//! Product vocabulary.
//!
//! The closed set of artifacts a transaction can request from the backend.
//! Each product has a fixed wire token; two of them are bulk-streaming
//! (relayed unparsed, exempt from fault scanning) and two are catalog
//! products fetched with `show` instead of a dataset bind.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Product {
    /// Attribute structure of a dataset
    AttributeStructure,
    /// Variable/descriptor structure of a dataset
    DescriptorStructure,
    /// Subsetted binary data (bulk stream)
    BinaryData,
    /// XML rendering of the full descriptor
    XmlDescriptor,
    /// ASCII rendering of subsetted data
    AsciiRendering,
    /// Raw file passthrough (bulk stream)
    RawFile,
    /// Backend version report
    VersionInfo,
    /// Catalog listing, optionally scoped to one dataset node
    CatalogInfo,
    /// HTML request form for a dataset
    HtmlForm,
}

impl Product {
    /// Token used on the backend wire.
    pub fn wire_token(&self) -> &'static str {
        match self {
            Product::AttributeStructure => "das",
            Product::DescriptorStructure => "dds",
            Product::BinaryData => "dods",
            Product::XmlDescriptor => "ddx",
            Product::AsciiRendering => "ascii",
            Product::RawFile => "stream",
            Product::VersionInfo => "version",
            Product::CatalogInfo => "catalog",
            Product::HtmlForm => "html_form",
        }
    }

    /// Bulk-data products are relayed unparsed and skip document scanning.
    pub fn is_streamed(&self) -> bool {
        matches!(self, Product::BinaryData | Product::RawFile)
    }

    /// Catalog products use `show` and need no dataset bind.
    pub fn uses_show(&self) -> bool {
        matches!(self, Product::VersionInfo | Product::CatalogInfo)
    }

    pub fn all() -> [Product; 9] {
        [
            Product::AttributeStructure,
            Product::DescriptorStructure,
            Product::BinaryData,
            Product::XmlDescriptor,
            Product::AsciiRendering,
            Product::RawFile,
            Product::VersionInfo,
            Product::CatalogInfo,
            Product::HtmlForm,
        ]
    }
}

impl std::fmt::Display for Product {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Product::AttributeStructure => "attribute-structure",
            Product::DescriptorStructure => "descriptor-structure",
            Product::BinaryData => "binary-data",
            Product::XmlDescriptor => "xml-descriptor",
            Product::AsciiRendering => "ascii-rendering",
            Product::RawFile => "raw-file",
            Product::VersionInfo => "version-info",
            Product::CatalogInfo => "catalog-info",
            Product::HtmlForm => "html-form",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for Product {
    type Err = String;

    /// Accepts both the vocabulary name and the wire token.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        for product in Product::all() {
            if normalized == product.to_string() || normalized == product.wire_token() {
                return Ok(product);
            }
        }
        Err(format!(
            "unknown product {:?}; expected one of: {}",
            s,
            Product::all()
                .iter()
                .map(|p| p.wire_token())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_tokens_are_stable() {
        assert_eq!(Product::AttributeStructure.wire_token(), "das");
        assert_eq!(Product::BinaryData.wire_token(), "dods");
        assert_eq!(Product::RawFile.wire_token(), "stream");
        assert_eq!(Product::HtmlForm.wire_token(), "html_form");
    }

    #[test]
    fn streaming_and_show_classification() {
        assert!(Product::BinaryData.is_streamed());
        assert!(Product::RawFile.is_streamed());
        assert!(!Product::AttributeStructure.is_streamed());

        assert!(Product::VersionInfo.uses_show());
        assert!(Product::CatalogInfo.uses_show());
        assert!(!Product::XmlDescriptor.uses_show());
    }

    #[test]
    fn parses_both_spellings() {
        assert_eq!("das".parse::<Product>().unwrap(), Product::AttributeStructure);
        assert_eq!(
            "attribute-structure".parse::<Product>().unwrap(),
            Product::AttributeStructure
        );
        assert_eq!("DODS".parse::<Product>().unwrap(), Product::BinaryData);
        assert!("dap4-checksums".parse::<Product>().is_err());
    }
}
