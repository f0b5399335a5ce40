//! Utility functions for the CLI

use console::style;

/// Print a success message
pub fn print_success(message: &str) {
    println!("{} {}", style("✓").green().bold(), message);
}

/// Print an error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", style("✗").red().bold(), message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", style("!").yellow().bold(), message);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", style("i").blue().bold(), message);
}

/// Parse the `--params` argument of `call`, defaulting to an empty array
pub fn parse_params(raw: Option<&str>) -> anyhow::Result<serde_json::Value> {
    let params = match raw {
        Some(raw) => serde_json::from_str(raw)?,
        None => serde_json::Value::Array(Vec::new()),
    };

    if !params.is_array() && !params.is_object() {
        anyhow::bail!("JSON-RPC params must be an array or an object, got {}", params);
    }

    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_params() {
        assert_eq!(parse_params(None).unwrap(), json!([]));
        assert_eq!(
            parse_params(Some(r#"["0xabc", "latest"]"#)).unwrap(),
            json!(["0xabc", "latest"])
        );
        assert!(parse_params(Some("42")).is_err());
        assert!(parse_params(Some("[")).is_err());
    }
}
