pub mod http;
pub(crate) mod ws;
