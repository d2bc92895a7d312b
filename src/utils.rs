//! Hashing and tokenization helpers shared by the filter compiler and the
//! matching engine.

use seahash::hash;

pub type Hash = u64;

#[inline]
pub fn fast_hash(input: &str) -> Hash {
    hash(input.as_bytes()) as Hash
}

fn is_allowed_filter(ch: char) -> bool {
    ch.is_alphanumeric() || ch == '%'
}

pub const TOKENS_BUFFER_SIZE: usize = 128;

/// A token extracted from a URL: the hash of one alphanumeric run, plus the
/// byte offset at which the run starts. The offset is what lets a bucket's
/// packed trie match from the exact position the token occupies.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UrlToken {
    pub hash: Hash,
    pub beg: usize,
}

fn fast_tokenizer<F>(pattern: &str, skip_first_token: bool, skip_last_token: bool, mut emit: F)
where
    F: FnMut(Hash, usize) -> bool,
{
    let mut inside = false;
    let mut start = 0;
    let mut preceding_ch: Option<char> = None; // a '*' voids the adjacent token

    for (i, c) in pattern.char_indices() {
        if is_allowed_filter(c) {
            if !inside {
                inside = true;
                start = i;
            }
        } else {
            if inside {
                inside = false;
                if (start != 0 || !skip_first_token)
                    && i - start > 1
                    && c != '*'
                    && preceding_ch != Some('*')
                    && !emit(fast_hash(&pattern[start..i]), start)
                {
                    return;
                }
            }
            preceding_ch = Some(c);
        }
    }

    if !skip_last_token && inside && pattern.len() - start > 1 && preceding_ch != Some('*') {
        emit(fast_hash(&pattern[start..]), start);
    }
}

/// Tokenize a request URL, keeping token positions. A zero-hash fallback
/// token is appended so that token-less filters are always probed.
pub fn tokenize_url(url: &str) -> Vec<UrlToken> {
    let mut tokens: Vec<UrlToken> = Vec::with_capacity(TOKENS_BUFFER_SIZE);
    fast_tokenizer(url, false, false, |hash, beg| {
        tokens.push(UrlToken { hash, beg });
        tokens.len() < TOKENS_BUFFER_SIZE - 1
    });
    tokens.push(UrlToken { hash: 0, beg: 0 });
    tokens
}

/// Tokenize a filter pattern. The first and last runs are skipped when the
/// pattern is not anchored on that side, since a partial run must not be
/// used as a bucket key.
pub fn tokenize_filter(
    pattern: &str,
    skip_first_token: bool,
    skip_last_token: bool,
) -> Vec<(Hash, usize)> {
    let mut tokens: Vec<(Hash, usize)> = Vec::with_capacity(TOKENS_BUFFER_SIZE);
    fast_tokenizer(pattern, skip_first_token, skip_last_token, |hash, beg| {
        tokens.push((hash, beg));
        tokens.len() < TOKENS_BUFFER_SIZE
    });
    tokens
}

pub fn bin_lookup<T: Ord>(arr: &[T], elt: T) -> bool {
    arr.binary_search(&elt).is_ok()
}
