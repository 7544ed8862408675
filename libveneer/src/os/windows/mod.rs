pub mod pe;
pub mod winapi;
