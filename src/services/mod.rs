pub mod circuit_breaker;
pub mod dispatcher;
pub mod merge;
pub mod persistence;
pub mod pipeline;
pub mod remote;
pub mod router;
