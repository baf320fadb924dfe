pub mod embedding;
pub mod index;
pub mod migrations;
pub mod rerank;
pub mod retrieval;
pub mod store;

use std::sync::Once;

pub use embedding::{
    EmbeddingProvider, GeminiEmbeddingProvider, OpenAiEmbeddingProvider, StubEmbeddingProvider,
};
pub use index::{write_index, DistanceMetric, RetrievalIndex, RetrievalRecord, ScoredRecord};
pub use rerank::{HttpReranker, LexicalReranker, Reranker};
pub use retrieval::{
    merge_chunks, BookSearch, Domain, FanOutResult, IndexSummary, NewsSearch,
    RetrievalCoordinator, RetrievalSettings, RetrievedChunk, SearchLog, CONTEXT_SEPARATOR,
};
pub use store::{ConversationStats, ConversationStore, NO_PREVIOUS_QUERY};

/// Register sqlite-vec for every connection opened afterwards.
pub(crate) fn init_sqlite_vec() {
    use rusqlite::ffi::{sqlite3, sqlite3_api_routines, sqlite3_auto_extension};

    type Sqlite3AutoExtFn =
        unsafe extern "C" fn(*mut sqlite3, *mut *mut i8, *const sqlite3_api_routines) -> i32;

    static INIT: Once = Once::new();
    INIT.call_once(|| unsafe {
        sqlite3_auto_extension(Some(std::mem::transmute::<*const (), Sqlite3AutoExtFn>(
            sqlite_vec::sqlite3_vec_init as *const (),
        )));
    });
}
