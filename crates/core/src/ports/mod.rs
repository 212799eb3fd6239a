mod directory;
mod gateway;
mod identity;
mod pagination;
mod repository;

pub use directory::*;
pub use gateway::*;
pub use identity::*;
pub use pagination::*;
pub use repository::*;
