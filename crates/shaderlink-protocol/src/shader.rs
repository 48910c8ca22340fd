//! Helpers for ShaderLab source text as it comes back from a generator.

use crate::tool::Diagnostic;

pub const DEFAULT_SHADER_NAME: &str = "Generated/Shader";

/// Name declared in the `Shader "Name"` header, if any.
pub fn extract_shader_name(code: &str) -> Option<String> {
    let mut offset = 0;
    while let Some(found) = code[offset..].find("Shader") {
        let start = offset + found;
        let after = &code[start + "Shader".len()..];
        offset = start + "Shader".len();

        let at_word_start = code[..start]
            .chars()
            .next_back()
            .is_none_or(|c| !(c.is_alphanumeric() || c == '_'));
        let trimmed = after.trim_start();
        if !at_word_start || trimmed.len() == after.len() {
            continue;
        }
        if let Some(body) = trimmed.strip_prefix('"')
            && let Some(end) = body.find('"')
            && end > 0
        {
            return Some(body[..end].to_owned());
        }
    }
    None
}

pub fn shader_name_or_default(code: &str) -> String {
    extract_shader_name(code).unwrap_or_else(|| DEFAULT_SHADER_NAME.to_owned())
}

/// Pull shader source out of free-form generator output: the first fenced
/// block wins, then anything from the `Shader "` header on, then the whole
/// text.
pub fn extract_shader_code(text: &str) -> String {
    if let Some(open) = text.find("```") {
        let after_fence = &text[open + 3..];
        let body_start = after_fence.find('\n').map_or(after_fence.len(), |i| i + 1);
        let body = &after_fence[body_start..];
        let body = body.find("```").map_or(body, |close| &body[..close]);
        return body.trim().to_owned();
    }
    if let Some(header) = text.find("Shader \"") {
        return text[header..].trim().to_owned();
    }
    text.trim().to_owned()
}

/// Cheap structural checks a peer without a real compiler can run.
pub fn structural_diagnostics(code: &str) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();

    if extract_shader_name(code).is_none() {
        diagnostics.push(Diagnostic::error(1, "missing `Shader \"Name\"` declaration"));
    }
    for (needle, message) in [
        ("SubShader", "missing SubShader block"),
        ("Pass", "missing Pass block"),
        ("#pragma vertex", "missing `#pragma vertex` directive"),
        ("#pragma fragment", "missing `#pragma fragment` directive"),
    ] {
        if !code.contains(needle) {
            diagnostics.push(Diagnostic::error(1, message));
        }
    }

    let opened = code.matches("HLSLPROGRAM").count();
    let closed = code.matches("ENDHLSL").count();
    if opened != closed {
        diagnostics.push(Diagnostic::error(
            last_line(code),
            format!("unbalanced HLSLPROGRAM/ENDHLSL ({opened} opened, {closed} closed)"),
        ));
    }

    let mut depth: i64 = 0;
    for (index, line) in code.lines().enumerate() {
        for c in line.chars() {
            match c {
                '{' => depth += 1,
                '}' => depth -= 1,
                _ => {}
            }
        }
        if depth < 0 {
            diagnostics.push(Diagnostic::error(line_number(index), "unexpected `}`"));
            depth = 0;
        }
    }
    if depth > 0 {
        diagnostics.push(Diagnostic::error(last_line(code), "unclosed `{` at end of file"));
    }

    if !code.contains("com.unity.render-pipelines") {
        diagnostics.push(Diagnostic::warning(
            1,
            "no render-pipeline include; shader may not render under URP",
        ));
    }

    diagnostics
}

fn line_number(index: usize) -> u32 {
    u32::try_from(index + 1).unwrap_or(u32::MAX)
}

fn last_line(code: &str) -> u32 {
    line_number(code.lines().count().saturating_sub(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD: &str = r#"Shader "Custom/Wave"
{
    SubShader
    {
        Pass
        {
            HLSLPROGRAM
            #pragma vertex vert
            #pragma fragment frag
            #include "Packages/com.unity.render-pipelines.universal/ShaderLibrary/Core.hlsl"
            ENDHLSL
        }
    }
}"#;

    #[test]
    fn name_comes_from_header() {
        assert_eq!(extract_shader_name(GOOD).as_deref(), Some("Custom/Wave"));
        assert_eq!(
            extract_shader_name("Shader   \"Spaced/Out\" {}").as_deref(),
            Some("Spaced/Out")
        );
    }

    #[test]
    fn sub_shader_keyword_is_not_a_header() {
        assert_eq!(extract_shader_name("SubShader \"x\" {}"), None);
        assert_eq!(shader_name_or_default("Pass {}"), DEFAULT_SHADER_NAME);
    }

    #[test]
    fn fenced_output_is_unwrapped() {
        let text = format!("Here you go:\n```hlsl\n{GOOD}\n```\nEnjoy.");
        assert_eq!(extract_shader_code(&text), GOOD);
    }

    #[test]
    fn prose_before_header_is_dropped() {
        let text = format!("Sure! {GOOD}");
        assert_eq!(extract_shader_code(&text), GOOD);
        assert_eq!(extract_shader_code("  plain  "), "plain");
    }

    #[test]
    fn well_formed_shader_has_no_errors() {
        assert!(structural_diagnostics(GOOD).iter().all(|d| !d.is_error()));
    }

    #[test]
    fn broken_shader_reports_errors() {
        let broken = GOOD.replace("ENDHLSL", "").replace("#pragma fragment frag", "");
        let errors: Vec<_> = structural_diagnostics(&broken)
            .into_iter()
            .filter(Diagnostic::is_error)
            .collect();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn missing_pipeline_include_is_only_a_warning() {
        let bare = GOOD.replace("com.unity.render-pipelines", "Legacy");
        let diagnostics = structural_diagnostics(&bare);
        assert_eq!(diagnostics.len(), 1);
        assert!(!diagnostics[0].is_error());
    }
}
