/// Replace `${ENV_VAR}` placeholders in config text.
///
/// Unresolvable and malformed placeholders are left as-is so a missing
/// variable shows up verbatim in error messages instead of as silence.
pub fn substitute_env(input: &str) -> String {
    substitute_env_with(input, |name| std::env::var(name).ok())
}

fn substitute_env_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) if end > 0 => {
                let name = &after[..end];
                match lookup(name) {
                    Some(value) => result.push_str(&value),
                    None => {
                        result.push_str("${");
                        result.push_str(name);
                        result.push('}');
                    },
                }
                rest = &after[end + 1..];
            },
            // `${}` or an unclosed placeholder: emit literally and move on.
            _ => {
                result.push_str("${");
                rest = after;
            },
        }
    }

    result.push_str(rest);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(name: &str) -> Option<String> {
        match name {
            "PORTICO_TEST_VAR" => Some("hello".into()),
            "OTHER" => Some("world".into()),
            _ => None,
        }
    }

    #[test]
    fn substitutes_known_var() {
        assert_eq!(
            substitute_env_with("key=${PORTICO_TEST_VAR}", lookup),
            "key=hello"
        );
    }

    #[test]
    fn substitutes_multiple_vars() {
        assert_eq!(
            substitute_env_with("${PORTICO_TEST_VAR} ${OTHER}!", lookup),
            "hello world!"
        );
    }

    #[test]
    fn leaves_unknown_var() {
        assert_eq!(
            substitute_env_with("key=${NOPE_NOT_SET}", lookup),
            "key=${NOPE_NOT_SET}"
        );
    }

    #[test]
    fn leaves_malformed_placeholders() {
        assert_eq!(substitute_env_with("key=${UNCLOSED", lookup), "key=${UNCLOSED");
        assert_eq!(substitute_env_with("key=${}", lookup), "key=${}");
    }

    #[test]
    fn plain_text_untouched() {
        assert_eq!(
            substitute_env_with("no placeholders $HERE", lookup),
            "no placeholders $HERE"
        );
    }
}
