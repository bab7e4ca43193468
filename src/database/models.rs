use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// Package models
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq, Eq)]
pub struct Package {
    pub id: i64,
    pub owner: String,
    pub name: String,
    pub lower_name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPackage {
    pub owner: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq, Eq)]
pub struct PackageVersion {
    pub id: i64,
    pub package_id: i64,
    pub creator: String,
    pub version: String,
    pub lower_version: String,
    pub is_internal: bool,
    pub metadata_json: String,
    pub download_count: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPackageVersion {
    pub package_id: i64,
    pub creator: String,
    pub version: String,
    pub is_internal: bool,
    pub metadata_json: String,
    pub download_count: i64,
}

// Blob models
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq, Eq)]
pub struct PackageBlob {
    pub id: i64,
    pub size: i64,
    pub hash_sha256: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPackageBlob {
    pub size: i64,
    pub hash_sha256: String,
}

// File models
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq, Eq)]
pub struct PackageFile {
    pub id: i64,
    pub version_id: i64,
    pub blob_id: i64,
    pub name: String,
    pub lower_name: String,
    pub is_lead: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPackageFile {
    pub version_id: i64,
    pub blob_id: i64,
    pub name: String,
    pub is_lead: bool,
}

/// What a property row is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[repr(i16)]
pub enum PropertyType {
    Version = 0,
    File = 1,
    Package = 2,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq, Eq)]
pub struct PackageProperty {
    pub id: i64,
    pub ref_type: PropertyType,
    pub ref_id: i64,
    pub name: String,
    pub value: String,
}

// Blob upload session rows
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq, Eq)]
pub struct BlobUpload {
    pub id: String,
    pub bytes_received: i64,
    pub hash_state: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Filters for the container file search. Every `Some` narrows the result.
#[derive(Debug, Clone, Default)]
pub struct FileSearchOptions {
    pub owner: Option<String>,
    pub image: Option<String>,
    pub digest: Option<String>,
    pub tag: Option<String>,
    pub repository: Option<String>,
    pub is_manifest: bool,
}
