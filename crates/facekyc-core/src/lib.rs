pub mod errors;
pub mod faces;
pub mod response;
pub mod secret;
