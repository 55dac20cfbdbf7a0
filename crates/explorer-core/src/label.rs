//! Label helpers: positional sort keys, identifier casing and description
//! prefix stripping.

/// Description prefix RSpec gives examples declared without a docstring.
pub const ANONYMOUS_EXAMPLE_PREFIX: &str = "example at ";

/// Positions from the bracketed part of an id: `a_spec.rb[1:2:3]` -> `[1, 2, 3]`.
///
/// Returns an empty list when the id carries no bracketed segment.
pub fn positions(id: &str) -> Vec<&str> {
    let (Some(open), Some(close)) = (id.find('['), id.rfind(']')) else {
        return Vec::new();
    };
    if close <= open {
        return Vec::new();
    }
    id[open + 1..close]
        .split(':')
        .filter(|segment| !segment.is_empty())
        .collect()
}

/// Sortable key made by concatenating the positional digits
/// (`[1:2:3]` -> `123`).
///
/// Ids with different segment counts can collide (`[1:23]` and `[12:3]`
/// both give `123`), so this is only meaningful between siblings in one
/// file. `None` if there are no positions or the result overflows.
pub fn location_key(id: &str) -> Option<u64> {
    let digits: String = positions(id).concat();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// `external_account` -> `ExternalAccount`. Paths are returned unchanged.
pub fn pascal_case(name: &str) -> String {
    if name.contains('/') {
        return name.to_string();
    }
    name.split('_')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

/// Remove a leading `file_label` (plus one following space) from a test
/// description. Only the first occurrence is touched, and labels that are
/// paths never match.
pub fn strip_file_prefix(file_label: &str, description: &str) -> String {
    if file_label.is_empty() || file_label.contains('/') {
        return description.to_string();
    }
    match description.strip_prefix(file_label) {
        Some(rest) => rest.strip_prefix(' ').unwrap_or(rest).to_string(),
        None => description.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_parse_bracketed_segment() {
        assert_eq!(positions("./spec/a_spec.rb[1:2:3]"), vec!["1", "2", "3"]);
        assert_eq!(positions("./spec/a_spec.rb[4]"), vec!["4"]);
        assert!(positions("./spec/a_spec.rb").is_empty());
    }

    #[test]
    fn location_key_concatenates_digits() {
        assert_eq!(location_key("./spec/a_spec.rb[1:2:3]"), Some(123));
        assert_eq!(location_key("./spec/a_spec.rb[10:1]"), Some(101));
        assert_eq!(location_key("./spec/a_spec.rb"), None);
    }

    #[test]
    fn location_key_collides_across_segment_counts() {
        assert_eq!(location_key("a[1:23]"), location_key("a[12:3]"));
    }

    #[test]
    fn pascal_case_joins_snake_segments() {
        assert_eq!(pascal_case("external_account"), "ExternalAccount");
        assert_eq!(pascal_case("foo"), "Foo");
        assert_eq!(pascal_case("api__client"), "ApiClient");
    }

    #[test]
    fn pascal_case_leaves_paths_alone() {
        assert_eq!(pascal_case("models/user"), "models/user");
    }

    #[test]
    fn strip_removes_leading_label() {
        assert_eq!(strip_file_prefix("Foo", "Foo does a thing"), "does a thing");
        assert_eq!(strip_file_prefix("Foo", "Foo#bar works"), "#bar works");
    }

    #[test]
    fn strip_only_touches_leading_occurrence() {
        assert_eq!(strip_file_prefix("Foo", "does Foo things"), "does Foo things");
        assert_eq!(strip_file_prefix("Foo", "Foo calls Foo"), "calls Foo");
    }

    #[test]
    fn strip_ignores_path_labels() {
        assert_eq!(
            strip_file_prefix("models/foo", "models/foo does a thing"),
            "models/foo does a thing"
        );
    }

    #[test]
    fn strip_is_idempotent_for_single_prefix() {
        let cases = [
            ("Foo", "Foo does a thing"),
            ("ExternalAccount", "ExternalAccount #balance sums entries"),
            ("Foo", "Bar unrelated"),
        ];
        for (label, description) in cases {
            let once = strip_file_prefix(label, description);
            assert_eq!(strip_file_prefix(label, &once), once);
        }
    }
}
