pub mod breaker;
pub mod client;
pub mod credential;
pub mod hygiene;
pub mod scheduler;
