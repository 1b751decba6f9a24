//! Opaque continuation tokens
//!
//! A token is the store cursor wrapped in a versioned JSON envelope and encoded as
//! URL-safe base64 without padding. Clients pass it back unchanged.

use crate::error::{Error, Result};
use crate::store::schema::TableSchema;
use crate::store::Item;
use serde::{Deserialize, Serialize};

const TOKEN_VERSION: u8 = 1;

#[derive(Serialize, Deserialize)]
struct Envelope {
    v: u8,
    k: Item,
}

/// Encode a store cursor for sharing with a client.
pub fn encode_token(cursor: &Item) -> Result<String> {
    let json = serde_json::to_vec(&Envelope {
        v: TOKEN_VERSION,
        k: cursor.clone(),
    })?;
    Ok(base64::Engine::encode(
        &base64::engine::general_purpose::URL_SAFE_NO_PAD,
        &json,
    ))
}

/// Decode a client token and check that its cursor fits the query it resumes.
pub fn decode_token(encoded: &str, table: &TableSchema, index: Option<&str>) -> Result<Item> {
    let json = base64::Engine::decode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, encoded)
        .map_err(|e| Error::invalid_input(format!("invalid pagination token: {}", e)))?;

    let envelope: Envelope = serde_json::from_slice(&json)
        .map_err(|e| Error::invalid_input(format!("invalid pagination token: {}", e)))?;
    if envelope.v != TOKEN_VERSION {
        return Err(Error::invalid_input(format!(
            "unsupported pagination token version {}",
            envelope.v
        )));
    }

    table
        .validate_cursor(index, &envelope.k)
        .map_err(|e| match e {
            Error::InvalidInput { message } => {
                Error::invalid_input(format!("pagination token does not match this query: {}", message))
            }
            other => other,
        })?;
    Ok(envelope.k)
}
