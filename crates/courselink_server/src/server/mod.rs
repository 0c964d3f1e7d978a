#![forbid(unsafe_code)]

pub mod app;
pub mod auth;
pub mod connection;
pub mod gateway;
pub mod health;
pub mod http;
pub mod relay;
pub mod room_router;
pub mod state;
pub mod store;
pub mod store_sql;

#[cfg(test)]
mod test_support;




#[cfg(test)]
mod room_router_tests;
