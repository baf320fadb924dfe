pub mod librarian;
pub mod memory_query;
pub mod news;
pub mod offer;
pub mod persona;
pub mod reporter;

pub use librarian::LibrarianHandler;
pub use memory_query::MemoryQueryHandler;
pub use news::NewsHandler;
pub use offer::OfferHandler;
pub use persona::PersonaHandler;
pub use reporter::ReporterHandler;
