pub mod backends;
pub mod config;
pub mod coordinator;
pub mod filter;
pub mod genotype;
pub mod intervals;
pub mod io;
pub mod ledger;
pub mod marker;
pub mod partition;
pub mod poller;
pub mod worker;
