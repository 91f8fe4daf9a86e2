//! Multipart part ingestion for an S3-compatible gateway.

#[macro_use]
pub mod error;

pub mod blob_store;
pub mod config;
pub mod kms;
pub mod limits;
pub mod meta_store;
pub mod metadata;
pub mod part_store;
pub mod pg_database;
pub mod pipeline;
pub mod s3_client;
pub mod service;
