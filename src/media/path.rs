//! Destination-path derivation for downloaded media
//!
//! Both layout strategies are pure functions of the source URL, so the same
//! URL always lands on the same destination path within one run and across
//! runs. That determinism is what cross-run reuse and deduplication rely on;
//! the per-path locking in the downloader collapses distinct URLs that derive
//! to the same destination.

use crate::config::MediaLayout;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::OnceLock;
use url::Url;

/// Canonical platform CDN hosts whose URL shapes are understood structurally
const CDN_HOSTS: &[&str] = &["cdn.discordapp.com", "media.discordapp.net"];

/// Signature query parameters re-issued on every CDN URL refresh; stripped
/// before hashing or comparison so re-signed URLs collapse to one resource
const SIGNATURE_PARAMS: &[&str] = &["ex", "is", "hm"];

/// Hosts that only ever appear as embed players; their URLs are never media
const EMBED_ONLY_HOSTS: &[&str] = &["youtube.com", "youtu.be", "spotify.com", "soundcloud.com"];

/// Static CDN serving the twemoji emoji image set
const TWEMOJI_CDN_HOST: &str = "cdn.jsdelivr.net";

/// Longest extension the nested layout will carry over from a URL
const MAX_EXTENSION_LEN: usize = 10;

/// In the legacy layout, a would-be extension longer than this is treated as
/// part of the filename (some services embed tokens after a dot)
const LEGACY_MAX_EXTENSION_LEN: usize = 41;

/// Legacy layout truncates the original filename stem to this many characters
const LEGACY_MAX_STEM_LEN: usize = 42;

#[allow(clippy::expect_used)]
fn proxy_thumbnail_host() -> &'static regex::Regex {
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        regex::Regex::new(r"^images-ext-\d+\.discordapp\.net$").expect("pattern is valid")
    })
}

/// Whether a URL must never be downloaded: embed-only platforms and the
/// platform's ephemeral image-proxy thumbnails (their signatures expire
/// before any archive would be read).
pub fn should_skip(url: &str) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    let host = host.to_ascii_lowercase();

    if proxy_thumbnail_host().is_match(&host) {
        return true;
    }
    EMBED_ONLY_HOSTS
        .iter()
        .any(|embed| host == *embed || host.ends_with(&format!(".{embed}")))
}

/// Normalize a URL for hashing and comparison.
///
/// On the canonical CDN the signature parameters are stripped; every other
/// URL is left byte-for-byte intact.
pub fn normalize_url(raw: &str) -> String {
    let Ok(mut url) = Url::parse(raw) else {
        return raw.to_string();
    };
    let is_cdn = url
        .host_str()
        .is_some_and(|h| CDN_HOSTS.contains(&h.to_ascii_lowercase().as_str()));
    if !is_cdn {
        return raw.to_string();
    }

    let retained: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !SIGNATURE_PARAMS.contains(&key.as_ref()))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    if retained.is_empty() {
        url.set_query(None);
    } else {
        let mut pairs = url.query_pairs_mut();
        pairs.clear();
        for (key, value) in &retained {
            pairs.append_pair(key, value);
        }
        drop(pairs);
    }
    url.to_string()
}

/// Derive the destination path (relative to the media directory) for a URL
/// under the given layout.
pub fn derive(url: &str, layout: MediaLayout) -> PathBuf {
    match layout {
        MediaLayout::Nested => nested_path(url),
        MediaLayout::Legacy => legacy_path(url),
    }
}

fn nested_path(url: &str) -> PathBuf {
    let normalized = normalize_url(url);
    let Ok(parsed) = Url::parse(&normalized) else {
        return external_path("unparsed", &normalized, None);
    };
    let host = parsed
        .host_str()
        .unwrap_or("unparsed")
        .to_ascii_lowercase();

    if CDN_HOSTS.contains(&host.as_str()) {
        return cdn_path(&parsed);
    }
    if host == TWEMOJI_CDN_HOST && is_twemoji_path(&parsed) {
        // Twemoji filenames are codepoint-derived and immutable upstream;
        // keep them verbatim so emoji render without a lookup table.
        if let Some(name) = last_segment(&parsed) {
            return PathBuf::from("twemoji").join(name);
        }
    }

    // Arbitrary external URLs can exceed filesystem path-length limits and
    // must never collide, so the path is content-addressed by a full hash
    // of the normalized URL.
    let extension = last_segment(&parsed).and_then(|name| extension_of(name, MAX_EXTENSION_LEN));
    external_path(&host, &normalized, extension.as_deref())
}

/// Structural parsing of the canonical CDN's known URL shapes.
///
/// Each resource type already carries a globally unique component (snowflake
/// id or content hash), which becomes the filename.
fn cdn_path(parsed: &Url) -> PathBuf {
    let segments: Vec<&str> = parsed
        .path_segments()
        .map(|s| s.filter(|seg| !seg.is_empty()).collect())
        .unwrap_or_default();

    match segments.as_slice() {
        ["emojis", file] => named_file("emojis", file),
        ["stickers", file] => named_file("stickers", file),
        ["attachments", _channel_id, attachment_id, file] => {
            let extension = extension_of(file, MAX_EXTENSION_LEN).unwrap_or_default();
            PathBuf::from("attachments").join(format!("{attachment_id}{extension}"))
        }
        ["icons", guild_id, file] => keyed_file("icons", guild_id, file),
        ["avatars", user_id, file] => keyed_file("avatars", user_id, file),
        ["guilds", _guild_id, "users", user_id, "avatars", file] => {
            keyed_file("avatars", user_id, file)
        }
        // Unrecognized CDN shape: keep the whole path, escaped into a single
        // flat filename so nothing is lost and nothing collides.
        _ => PathBuf::from(urlencoding::encode(parsed.path().trim_start_matches('/')).into_owned()),
    }
}

/// `{category}/{stem}{ext}`
fn named_file(category: &str, file: &str) -> PathBuf {
    let stem = stem_of(file, MAX_EXTENSION_LEN);
    let extension = extension_of(file, MAX_EXTENSION_LEN).unwrap_or_default();
    PathBuf::from(category).join(format!("{stem}{extension}"))
}

/// `{category}/{key}_{stem}{ext}` — used where the filename alone (a content
/// hash) is only unique per owning entity
fn keyed_file(category: &str, key: &str, file: &str) -> PathBuf {
    let stem = stem_of(file, MAX_EXTENSION_LEN);
    let extension = extension_of(file, MAX_EXTENSION_LEN).unwrap_or_default();
    PathBuf::from(category).join(format!("{key}_{stem}{extension}"))
}

fn external_path(host: &str, normalized: &str, extension: Option<&str>) -> PathBuf {
    let hash = sha256_hex(normalized);
    PathBuf::from("external")
        .join(host)
        .join(format!("{hash}{}", extension.unwrap_or_default()))
}

fn legacy_path(url: &str) -> PathBuf {
    let normalized = normalize_url(url);
    let hash = &sha256_hex(&normalized)[..5];

    let file_name = Url::parse(&normalized)
        .ok()
        .and_then(|parsed| last_segment(&parsed).map(str::to_string))
        .filter(|name| !name.is_empty());

    match file_name {
        Some(name) => {
            let stem = truncate_chars(&stem_of(&name, LEGACY_MAX_EXTENSION_LEN), LEGACY_MAX_STEM_LEN);
            let extension = extension_of(&name, LEGACY_MAX_EXTENSION_LEN).unwrap_or_default();
            PathBuf::from(format!("{stem}-{hash}{extension}"))
        }
        None => PathBuf::from(hash),
    }
}

fn is_twemoji_path(parsed: &Url) -> bool {
    parsed.path_segments().is_some_and(|mut segments| {
        segments.any(|seg| seg == "twemoji" || seg.starts_with("twemoji@"))
    })
}

fn last_segment(parsed: &Url) -> Option<&str> {
    parsed
        .path_segments()
        .and_then(|segments| segments.filter(|seg| !seg.is_empty()).next_back())
}

/// Extension including the leading dot, or `None` when the filename has no
/// dot or the would-be extension exceeds `max_len` characters.
fn extension_of(file_name: &str, max_len: usize) -> Option<String> {
    let (_, ext) = file_name.rsplit_once('.')?;
    if ext.is_empty() || ext.len() > max_len {
        return None;
    }
    Some(format!(".{ext}"))
}

/// Filename without its extension, under the same extension-length rule as
/// [`extension_of`]: an over-long "extension" stays part of the stem.
fn stem_of(file_name: &str, max_ext_len: usize) -> String {
    match file_name.rsplit_once('.') {
        Some((stem, ext)) if !ext.is_empty() && ext.len() <= max_ext_len && !stem.is_empty() => {
            stem.to_string()
        }
        _ => file_name.to_string(),
    }
}

fn truncate_chars(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

fn sha256_hex(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    format!("{:x}", hasher.finalize())
}
