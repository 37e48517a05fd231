//! Transactional persistence: the gateway and its consistency guard.

pub mod gateway;
pub mod guard;

pub use gateway::{
    Isolation, PersistenceGateway, CANCELLED_REASON, LEASE_EXPIRED_REASON, MAX_PAGE_SIZE,
};
