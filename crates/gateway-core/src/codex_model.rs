/// Collapses codex-style model suffixes some upstreams append (e.g. a
/// dated snapshot suffix) down to the canonical model name. Opaque to the
/// rest of the core beyond "does this change anything": returns `None` when
/// the input is already canonical.
///
/// This runs *after* the account's own `map_model`, and when it does change
/// the string, its result becomes the new `mapped_model` — intentionally
/// capable of overriding the account's own mapping (see DESIGN.md / §9).
pub fn normalize_codex_model(model: &str) -> Option<String> {
    const PREFIX: &str = "codex-";
    if !model.starts_with(PREFIX) {
        return None;
    }
    let rest = &model[PREFIX.len()..];
    let collapsed = rest.split('-').next().unwrap_or(rest);
    let normalized = format!("{PREFIX}{collapsed}");
    if normalized == model {
        None
    } else {
        Some(normalized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_dated_suffix() {
        assert_eq!(
            normalize_codex_model("codex-mini-2024-09-01"),
            Some("codex-mini".to_string())
        );
    }

    #[test]
    fn leaves_non_codex_model_alone() {
        assert_eq!(normalize_codex_model("gpt-4o"), None);
    }

    #[test]
    fn leaves_already_canonical_model_alone() {
        assert_eq!(normalize_codex_model("codex-mini"), None);
    }
}
