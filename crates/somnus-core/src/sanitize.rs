/// Clean model-generated HTML before it reaches a view.
///
/// Strips a wrapping markdown code fence, then drops scripts, event handlers
/// and anything else outside ammonia's allow-list.
pub fn sanitize_html(raw: &str) -> String {
    let unfenced = strip_code_fence(raw);
    ammonia::clean(unfenced.trim())
}

fn strip_code_fence(raw: &str) -> &str {
    let Ok(re) = regex_lite::Regex::new(r"(?s)^\s*```[A-Za-z]*\s*\n(.*?)\n?\s*```\s*$") else {
        return raw;
    };
    match re.captures(raw).and_then(|c| c.get(1)) {
        Some(inner) => inner.as_str(),
        None => raw,
    }
}
