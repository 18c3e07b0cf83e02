//! HTTP implementation of the CRM collaborator contracts.

pub mod client;

pub use client::HttpCrmClient;
