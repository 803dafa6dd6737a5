//! SQL templating helpers.
//!
//! Identifiers and values take different escaping routes: values are always
//! bound as parameters, identifiers are double-quoted here. Nothing in this
//! module touches a connection.

/// Quote an identifier (table or column name) for safe interpolation.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// The `json_extract` path for a top-level document field.
///
/// The path is meant to be bound as a statement parameter, never spliced
/// into SQL text.
pub fn json_path(field: &str) -> String {
    format!("$.{field}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_plain_identifiers() {
        assert_eq!(quote_ident("history"), "\"history\"");
    }

    #[test]
    fn escapes_embedded_quotes() {
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn json_paths_are_rooted() {
        assert_eq!(json_path("count"), "$.count");
    }
}
