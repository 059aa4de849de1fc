const MAX_STEM_CHARS: usize = 40;

/// Derives a filesystem-safe archive entry name from a prompt.
///
/// The stem is lowercased, runs of non-alphanumeric characters collapse to a
/// single underscore, and the result is capped at a fixed length. `position`
/// is the job's 1-based position among the exported jobs and keeps entries
/// unique even when two prompts sanitize to the same stem.
pub fn archive_entry_name(prompt: &str, position: usize, extension: &str) -> String {
    let mut stem = String::new();
    let mut last_was_separator = true;
    for ch in prompt.chars() {
        if stem.chars().count() >= MAX_STEM_CHARS {
            break;
        }
        if ch.is_ascii_alphanumeric() {
            stem.extend(ch.to_lowercase());
            last_was_separator = false;
        } else if !last_was_separator {
            stem.push('_');
            last_was_separator = true;
        }
    }
    let stem = stem.trim_matches('_');
    let stem = if stem.is_empty() { "image" } else { stem };
    format!("{stem}_{position:03}.{extension}")
}
