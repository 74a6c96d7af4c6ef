//! WBI request signing for the player endpoints.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use md5::{Digest, Md5};
use url::form_urlencoded;

pub const MIXIN_KEY_TTL: Duration = Duration::from_secs(3600);

const MIXIN_KEY_ENC_TAB: [usize; 64] = [
    46, 47, 18, 2, 53, 8, 23, 32, 15, 50, 10, 31, 58, 3, 45, 35, 27, 43, 5, 49, 33, 9, 42, 19, 29,
    28, 14, 39, 12, 38, 41, 13, 37, 48, 7, 16, 24, 55, 40, 61, 26, 17, 0, 1, 60, 51, 30, 4, 22, 25,
    54, 21, 56, 59, 6, 63, 57, 62, 11, 36, 20, 34, 44, 52,
];

const STRIPPED_VALUE_CHARS: &[char] = &['!', '\'', '(', ')', '*'];

/// `https://i0.hdslb.com/bfs/wbi/<key>.png` -> `<key>`.
pub fn key_from_url(url: &str) -> Option<&str> {
    let file = url.rsplit('/').next()?;
    let key = file.split('.').next()?;
    (!key.is_empty()).then_some(key)
}

/// `None` when the two keys are too short to permute.
pub fn mixin_key(img_key: &str, sub_key: &str) -> Option<String> {
    let raw: Vec<char> = img_key.chars().chain(sub_key.chars()).collect();
    if raw.len() < MIXIN_KEY_ENC_TAB.len() {
        return None;
    }
    Some(MIXIN_KEY_ENC_TAB.iter().take(32).map(|index| raw[*index]).collect())
}

/// Returns the parameters sorted by key with `wts` and `w_rid` appended.
pub fn sign(params: &[(String, String)], mixin_key: &str, wts: u64) -> Vec<(String, String)> {
    let mut signed: Vec<(String, String)> = params
        .iter()
        .map(|(key, value)| (key.clone(), value.replace(STRIPPED_VALUE_CHARS, "")))
        .collect();
    signed.push(("wts".to_string(), wts.to_string()));
    signed.sort_by(|a, b| a.0.cmp(&b.0));

    let query = form_urlencoded::Serializer::new(String::new())
        .extend_pairs(signed.iter())
        .finish();
    let w_rid = md5_hex(format!("{query}{mixin_key}").as_bytes());
    signed.push(("w_rid".to_string(), w_rid));
    signed
}

pub fn md5_hex(bytes: &[u8]) -> String {
    hex::encode(Md5::digest(bytes))
}

/// Mixin key cached for [`MIXIN_KEY_TTL`].
#[derive(Debug)]
pub struct MixinKeyCache {
    ttl: Duration,
    entry: Mutex<Option<(String, Instant)>>,
}

impl Default for MixinKeyCache {
    fn default() -> Self {
        Self::new(MIXIN_KEY_TTL)
    }
}

impl MixinKeyCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entry: Mutex::new(None),
        }
    }

    pub fn get(&self) -> Option<String> {
        let guard = self.entry.lock().ok()?;
        guard
            .as_ref()
            .filter(|(_, stored)| stored.elapsed() < self.ttl)
            .map(|(key, _)| key.clone())
    }

    pub fn store(&self, key: String) {
        if let Ok(mut guard) = self.entry.lock() {
            *guard = Some((key, Instant::now()));
        }
    }
}
