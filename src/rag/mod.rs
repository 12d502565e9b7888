//! Retrieval over clinic documents.
//!
//! - `DocumentIndex`: in-memory cosine index, read-mostly
//! - `Retriever`: embeds a query and searches the index
//! - `ingest`: loads the clinic tables into the index at startup

mod document;
pub mod ingest;
mod index;
mod retriever;

pub use document::{Document, RetrievalResult, RetrievedDocument, CATEGORY_KEY};
pub use index::DocumentIndex;
pub use retriever::{Retrieval, Retriever};
