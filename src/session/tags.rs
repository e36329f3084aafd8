use indexmap::IndexMap;

/// Reference-counted multiset of debug tags contributed by engines.
///
/// Deltas report only count transitions over the zero boundary: a tag appears in the `add`
/// delta when its count goes 0→1 and in the `remove` delta when it goes 1→0. Delta order
/// follows the input order of the transitioning tags.
#[derive(Default)]
pub(crate) struct TagsMultiset {
    counts: IndexMap<String, usize>,
}

impl TagsMultiset {
    /// Fold tags in, return those that became visible.
    pub fn add<'a>(&mut self, tags: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        let mut appeared = Vec::new();
        for tag in tags {
            let count = self.counts.entry(tag.to_string()).or_insert(0);
            *count += 1;
            if *count == 1 {
                appeared.push(tag.to_string());
            }
        }
        appeared
    }

    /// Fold tags out, return those that disappeared. Removing an untracked tag is ignored.
    pub fn remove<'a>(&mut self, tags: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        let mut vanished = Vec::new();
        for tag in tags {
            match self.counts.get_mut(tag) {
                Some(count) if *count > 1 => *count -= 1,
                Some(_) => {
                    self.counts.shift_remove(tag);
                    vanished.push(tag.to_string());
                }
                None => {
                    log::debug!(target: "session", "remove of untracked tag `{tag}`");
                }
            }
        }
        vanished
    }

    /// Currently visible tags, in first-appearance order.
    pub fn snapshot(&self) -> Vec<String> {
        self.counts.keys().cloned().collect()
    }

    #[cfg(test)]
    pub fn count(&self, tag: &str) -> usize {
        self.counts.get(tag).copied().unwrap_or(0)
    }
}
