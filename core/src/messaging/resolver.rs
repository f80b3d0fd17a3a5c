// Topic binding resolution
use dashmap::DashMap;

/// Matches subscription bindings against published topics.
///
/// Topics are `.`-separated words. In a binding, `*` matches exactly one word
/// and `#` matches zero or more words; any other word must match literally.
///
/// Results are cached per `(binding, topic)` pair. Callers publishing on
/// single-use topics (replies) pass `no_cache = true` so the cache is neither
/// consulted nor populated for them.
#[derive(Debug, Default)]
pub struct TopicResolver {
    cache: DashMap<(String, String), bool>,
}

impl TopicResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether `binding` matches `topic`.
    pub fn compare(&self, binding: &str, topic: &str, no_cache: bool) -> bool {
        if no_cache {
            return matches(binding, topic);
        }
        let key = (binding.to_string(), topic.to_string());
        if let Some(hit) = self.cache.get(&key) {
            return *hit;
        }
        let result = matches(binding, topic);
        self.cache.insert(key, result);
        result
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn reset(&self) {
        self.cache.clear();
    }
}

fn matches(binding: &str, topic: &str) -> bool {
    if binding == topic {
        return true;
    }
    if !binding.contains('*') && !binding.contains('#') {
        return false;
    }
    let pattern: Vec<&str> = binding.split('.').collect();
    let words: Vec<&str> = topic.split('.').collect();
    match_words(&pattern, &words)
}

fn match_words(pattern: &[&str], words: &[&str]) -> bool {
    match pattern.split_first() {
        None => words.is_empty(),
        Some((&"#", rest)) => (0..=words.len()).any(|skip| match_words(rest, &words[skip..])),
        Some((&"*", rest)) => !words.is_empty() && match_words(rest, &words[1..]),
        Some((word, rest)) => {
            words.first() == Some(word) && match_words(rest, &words[1..])
        }
    }
}
