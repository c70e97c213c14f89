//! Entry enrichment: page metadata scraping and image compression.
//!
//! Both components fail soft. Errors are logged and turned into a degraded
//! result (fallback description, no image) so a bad page never aborts a run.

mod enricher;
mod image;

pub use self::image::{compress_bytes, CompressError, ImageAsset, ImageCompressor};
pub use enricher::{
    extract_metadata, EnrichError, Enrichment, PageEnricher, PageMetadata,
    DEFAULT_FALLBACK_IMAGE_URL,
};
