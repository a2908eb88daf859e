pub mod dispatcher;
pub mod encryption;
pub mod models;
pub mod senders;
pub mod signing;
