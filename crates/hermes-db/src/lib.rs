pub mod executor;
pub mod tenants;

pub use executor::PgExecutor;
pub use tenants::StaticTenantResolver;
