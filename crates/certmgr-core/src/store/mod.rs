// # Store Implementations
//
// The persisted store is owned by an external collaborator; this module
// ships the in-memory implementation of the `CertificateStore` contract
// used by tests and by the daemon.

pub mod memory;

pub use memory::MemoryStore;
