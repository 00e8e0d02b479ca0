pub mod comment_service;
pub mod doc_service;

pub use comment_service::CommentService;
pub use doc_service::{DocumentContent, DocumentService};
