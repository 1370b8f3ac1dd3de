//! Minimal text-diff utility.
//!
//! Computes `(position, delete_count, insert_text)` edits between two
//! strings via longest common prefix and suffix. One edit at most comes
//! out of [`compute_text_edits`]; the result feeds the collaborative-text
//! container so that transmitted operations stay minimal instead of
//! rewriting whole files.
//!
//! Positions count unicode scalar values, matching the text container's
//! index space.

/// One text edit: at `pos`, remove `delete` chars, then insert `insert`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextEdit {
    /// Edit position in chars
    pub pos: usize,
    /// Chars to delete at `pos`
    pub delete: usize,
    /// Text to insert at `pos` after deleting
    pub insert: String,
}

/// Compute the minimal edit list transforming `old` into `new`.
///
/// Fast paths: equal strings produce no edits; empty-to-text and
/// text-to-empty produce a single insert or delete. Otherwise the longest
/// common prefix is found first, then the longest common suffix that does
/// not overlap it, and the differing middle becomes one edit.
#[must_use]
pub fn compute_text_edits(old: &str, new: &str) -> Vec<TextEdit> {
    if old == new {
        return Vec::new();
    }

    let old_chars: Vec<char> = old.chars().collect();
    let new_chars: Vec<char> = new.chars().collect();

    if old_chars.is_empty() {
        return vec![TextEdit {
            pos: 0,
            delete: 0,
            insert: new.to_string(),
        }];
    }
    if new_chars.is_empty() {
        return vec![TextEdit {
            pos: 0,
            delete: old_chars.len(),
            insert: String::new(),
        }];
    }

    let max_prefix = old_chars.len().min(new_chars.len());
    let mut prefix = 0;
    while prefix < max_prefix && old_chars[prefix] == new_chars[prefix] {
        prefix += 1;
    }

    // Suffix must not overlap the prefix on either side
    let max_suffix = max_prefix - prefix;
    let mut suffix = 0;
    while suffix < max_suffix
        && old_chars[old_chars.len() - 1 - suffix] == new_chars[new_chars.len() - 1 - suffix]
    {
        suffix += 1;
    }

    let delete = old_chars.len() - prefix - suffix;
    let insert: String = new_chars[prefix..new_chars.len() - suffix].iter().collect();

    if delete == 0 && insert.is_empty() {
        return Vec::new();
    }

    vec![TextEdit {
        pos: prefix,
        delete,
        insert,
    }]
}

/// Apply edits (as produced by [`compute_text_edits`]) to `old`.
///
/// Edits are applied in descending position order so earlier positions
/// stay valid.
#[must_use]
pub fn apply_text_edits(old: &str, edits: &[TextEdit]) -> String {
    let mut chars: Vec<char> = old.chars().collect();

    let mut ordered: Vec<&TextEdit> = edits.iter().collect();
    ordered.sort_by(|a, b| b.pos.cmp(&a.pos));

    for edit in ordered {
        let pos = edit.pos.min(chars.len());
        let end = (pos + edit.delete).min(chars.len());
        chars.splice(pos..end, edit.insert.chars());
    }

    chars.into_iter().collect()
}

/// Coalesce contiguous or overlapping edits into fewer edits.
///
/// Input edits must be position-sorted ascending and non-overlapping in
/// their original-document coordinates; adjacent runs collapse into one.
#[must_use]
pub fn merge_adjacent_edits(edits: &[TextEdit]) -> Vec<TextEdit> {
    let mut merged: Vec<TextEdit> = Vec::with_capacity(edits.len());

    for edit in edits {
        match merged.last_mut() {
            Some(last) if edit.pos <= last.pos + last.delete => {
                // Contiguous or overlapping in the original document
                let overlap = last.pos + last.delete - edit.pos;
                last.delete += edit.delete.saturating_sub(overlap);
                last.insert.push_str(&edit.insert);
            }
            _ => merged.push(edit.clone()),
        }
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(old: &str, new: &str) {
        let edits = compute_text_edits(old, new);
        assert_eq!(apply_text_edits(old, &edits), new, "{old:?} -> {new:?}");
    }

    #[test]
    fn test_equal_strings_no_edits() {
        assert!(compute_text_edits("same", "same").is_empty());
        assert!(compute_text_edits("", "").is_empty());
    }

    #[test]
    fn test_empty_to_text() {
        let edits = compute_text_edits("", "hello");
        assert_eq!(
            edits,
            vec![TextEdit {
                pos: 0,
                delete: 0,
                insert: "hello".into()
            }]
        );
        roundtrip("", "hello");
    }

    #[test]
    fn test_text_to_empty() {
        let edits = compute_text_edits("hello", "");
        assert_eq!(
            edits,
            vec![TextEdit {
                pos: 0,
                delete: 5,
                insert: String::new()
            }]
        );
        roundtrip("hello", "");
    }

    #[test]
    fn test_append() {
        let edits = compute_text_edits("Hello", "Hello, world");
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].pos, 5);
        assert_eq!(edits[0].delete, 0);
        assert_eq!(edits[0].insert, ", world");
        roundtrip("Hello", "Hello, world");
    }

    #[test]
    fn test_middle_replacement() {
        let edits = compute_text_edits("one two three", "one 2 three");
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].pos, 4);
        assert_eq!(edits[0].delete, 3);
        assert_eq!(edits[0].insert, "2");
        roundtrip("one two three", "one 2 three");
    }

    #[test]
    fn test_prefix_suffix_no_overlap() {
        // "aa" -> "aaa": naive prefix+suffix would double-count
        roundtrip("aa", "aaa");
        roundtrip("aaa", "aa");
        roundtrip("abab", "ab");
        roundtrip("ab", "abab");
    }

    #[test]
    fn test_unicode_positions() {
        // Positions are chars, not bytes
        let edits = compute_text_edits("héllo", "héllö");
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].pos, 4);
        roundtrip("héllo", "héllö");
        roundtrip("日本語のメモ", "日本語のノート");
    }

    #[test]
    fn test_merge_contiguous() {
        let edits = vec![
            TextEdit {
                pos: 0,
                delete: 2,
                insert: "ab".into(),
            },
            TextEdit {
                pos: 2,
                delete: 3,
                insert: "cd".into(),
            },
        ];
        let merged = merge_adjacent_edits(&edits);
        assert_eq!(
            merged,
            vec![TextEdit {
                pos: 0,
                delete: 5,
                insert: "abcd".into()
            }]
        );
    }

    #[test]
    fn test_merge_disjoint_stays_separate() {
        let edits = vec![
            TextEdit {
                pos: 0,
                delete: 1,
                insert: "x".into(),
            },
            TextEdit {
                pos: 10,
                delete: 1,
                insert: "y".into(),
            },
        ];
        assert_eq!(merge_adjacent_edits(&edits).len(), 2);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_apply_compute_is_identity(old in ".{0,200}", new in ".{0,200}") {
                let edits = compute_text_edits(&old, &new);
                prop_assert_eq!(apply_text_edits(&old, &edits), new);
            }

            #[test]
            fn prop_at_most_one_edit(old in ".{0,100}", new in ".{0,100}") {
                prop_assert!(compute_text_edits(&old, &new).len() <= 1);
            }

            #[test]
            fn prop_unicode_heavy(old in "[ありがとうa-z ]{0,60}", new in "[ありがとうa-z ]{0,60}") {
                let edits = compute_text_edits(&old, &new);
                prop_assert_eq!(apply_text_edits(&old, &edits), new);
            }
        }
    }
}
