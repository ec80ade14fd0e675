//! Opaque page cursors and the page-assembly helpers shared by every listing.
//!
//! A cursor is base64url (no padding) over a small JSON object. Two shapes are
//! understood: the legacy `{"offset": n}` and the keyset
//! `{"version": 2, "sort", "primary", "secondary", "id"}`.
//!
//! Keyset listings order rows by the tuple `(primary DESC, secondary DESC, id DESC)`.
//! `secondary` is always the published time in epoch milliseconds and `id` is
//! unique, so the order is total and a scan never repeats or skips a row.

use crate::errors::{AppError, AppResult};
use crate::models::{CommentRecord, PageResponse, PostRecord, PostSort};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

pub const KEYSET_CURSOR_VERSION: u32 = 2;
pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_LISTING_PAGE_SIZE: u32 = 200;
pub const MAX_RANKING_PAGE_SIZE: u32 = 500;
const MAX_CURSOR_TOKEN_LEN: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysetCursor {
    pub version: u32,
    pub sort: PostSort,
    pub primary: i64,
    pub secondary: i64,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cursor {
    Keyset(KeysetCursor),
    Offset { offset: u64 },
}

/// Sort-key tuple of a row under a given sort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeysetKey<'a> {
    pub primary: i64,
    pub secondary: i64,
    pub id: &'a str,
}

impl KeysetKey<'_> {
    pub fn to_cursor(&self, sort: PostSort) -> Cursor {
        Cursor::Keyset(KeysetCursor {
            version: KEYSET_CURSOR_VERSION,
            sort,
            primary: self.primary,
            secondary: self.secondary,
            id: self.id.to_string(),
        })
    }
}

pub trait KeysetRow {
    fn keyset_key(&self, sort: PostSort) -> KeysetKey<'_>;
}

impl KeysetRow for PostRecord {
    fn keyset_key(&self, sort: PostSort) -> KeysetKey<'_> {
        let published = self.metrics.published_at.timestamp_millis();
        let primary = match sort {
            PostSort::Exposure => clamp_i64(self.metrics.exposure),
            PostSort::Engagement => clamp_i64(self.metrics.engagement),
            PostSort::PublishedAt => published,
        };
        KeysetKey {
            primary,
            secondary: published,
            id: &self.post_id,
        }
    }
}

impl KeysetRow for CommentRecord {
    /// Comments only sort by published time; every sort maps onto it.
    fn keyset_key(&self, _sort: PostSort) -> KeysetKey<'_> {
        let published = self.published_at.timestamp_millis();
        KeysetKey {
            primary: published,
            secondary: published,
            id: &self.comment_id,
        }
    }
}

pub fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Listing order: `(primary DESC, secondary DESC, id DESC)`.
pub fn compare_keyset_desc(a: &KeysetKey<'_>, b: &KeysetKey<'_>) -> Ordering {
    b.primary
        .cmp(&a.primary)
        .then_with(|| b.secondary.cmp(&a.secondary))
        .then_with(|| b.id.cmp(a.id))
}

/// True when `key` sorts strictly after the cursor position in listing order.
pub fn is_after_cursor(key: &KeysetKey<'_>, cursor: &KeysetCursor) -> bool {
    (key.primary, key.secondary, key.id) < (cursor.primary, cursor.secondary, cursor.id.as_str())
}

pub fn encode_cursor(cursor: &Cursor) -> AppResult<String> {
    let bytes = serde_json::to_vec(cursor)?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

pub fn decode_cursor(token: &str) -> AppResult<Cursor> {
    let token = token.trim();
    if token.is_empty() {
        return Err(AppError::Validation("Invalid cursor: empty token".to_string()));
    }
    if token.len() > MAX_CURSOR_TOKEN_LEN {
        return Err(AppError::Validation("Invalid cursor: token exceeds max length".to_string()));
    }
    let bytes = URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|error| AppError::Validation(format!("Invalid cursor encoding: {}", error)))?;
    let cursor: Cursor = serde_json::from_slice(&bytes)
        .map_err(|error| AppError::Validation(format!("Invalid cursor payload: {}", error)))?;
    if let Cursor::Keyset(keyset) = &cursor {
        if keyset.version != KEYSET_CURSOR_VERSION {
            return Err(AppError::Validation(format!(
                "Unsupported cursor version {} (expected {})",
                keyset.version, KEYSET_CURSOR_VERSION
            )));
        }
    }
    Ok(cursor)
}

/// Decodes a cursor for a keyset listing; a keyset cursor issued for another sort is rejected.
pub fn decode_for_sort(token: Option<&str>, sort: PostSort) -> AppResult<Option<Cursor>> {
    let Some(token) = token else {
        return Ok(None);
    };
    let cursor = decode_cursor(token)?;
    if let Cursor::Keyset(keyset) = &cursor {
        if keyset.sort != sort {
            return Err(AppError::Validation(format!(
                "Cursor sort '{}' does not match requested sort '{}'",
                keyset.sort.as_str(),
                sort.as_str()
            )));
        }
    }
    Ok(Some(cursor))
}

/// Decodes a cursor for an offset listing; keyset cursors are rejected.
pub fn decode_offset(token: Option<&str>) -> AppResult<u64> {
    match token.map(decode_cursor).transpose()? {
        None => Ok(0),
        Some(Cursor::Offset { offset }) => Ok(offset),
        Some(Cursor::Keyset(_)) => Err(AppError::Validation(
            "Keyset cursor is not valid for this listing".to_string(),
        )),
    }
}

pub fn clamp_page_size(limit: Option<u32>, max: u32) -> u32 {
    limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, max)
}

/// Builds a page from rows fetched with `limit + 1`; the extra row only signals `has_next`.
pub fn finish_keyset_page<T: KeysetRow>(
    mut rows: Vec<T>,
    limit: u32,
    sort: PostSort,
    total_approx: Option<u64>,
) -> AppResult<PageResponse<T>> {
    let has_next = rows.len() > limit as usize;
    rows.truncate(limit as usize);
    let next_cursor = match rows.last() {
        Some(last) if has_next => Some(encode_cursor(&last.keyset_key(sort).to_cursor(sort))?),
        _ => None,
    };
    Ok(PageResponse {
        items: rows,
        next_cursor,
        has_next,
        total_approx,
    })
}

/// Offset page from rows fetched with `limit + 1` starting at `offset`.
pub fn finish_offset_page<T>(mut rows: Vec<T>, offset: u64, limit: u32, total_approx: Option<u64>) -> AppResult<PageResponse<T>> {
    let has_next = rows.len() > limit as usize;
    rows.truncate(limit as usize);
    let next_cursor = if has_next {
        Some(encode_cursor(&Cursor::Offset {
            offset: offset + rows.len() as u64,
        })?)
    } else {
        None
    };
    Ok(PageResponse {
        items: rows,
        next_cursor,
        has_next,
        total_approx,
    })
}

/// Offset pagination over an already ordered in-memory list.
pub fn paginate_offset<T>(items: Vec<T>, limit: Option<u32>, max: u32, cursor: Option<&str>) -> AppResult<PageResponse<T>> {
    let total = items.len() as u64;
    let offset = decode_offset(cursor)?;
    let page_size = clamp_page_size(limit, max);
    let skip = usize::try_from(offset).unwrap_or(usize::MAX);
    let rows: Vec<T> = items.into_iter().skip(skip).take(page_size as usize + 1).collect();
    finish_offset_page(rows, offset, page_size, Some(total))
}
