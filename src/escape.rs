//! Escaping helpers called by generated code.

/// Replace `&`, `<` and `>` with entity references.
pub fn escape_text(value: &str) -> String {
  escape(value, false)
}

/// Like [`escape_text`], additionally escaping `"` and `'` for use inside a
/// quoted attribute value.
pub fn escape_attr(value: &str) -> String {
  escape(value, true)
}

fn escape(value: &str, quotes: bool) -> String {
  let mut out = String::with_capacity(value.len());
  for c in value.chars() {
    match c {
      '&' => out.push_str("&amp;"),
      '<' => out.push_str("&lt;"),
      '>' => out.push_str("&gt;"),
      '"' if quotes => out.push_str("&quot;"),
      '\'' if quotes => out.push_str("&#39;"),
      _ => out.push(c),
    }
  }
  out
}

#[cfg(test)]
mod tests {
  use super::*;
  use proptest::prelude::*;

  #[test]
  fn text_keeps_quotes() {
    assert_eq!(
      escape_text(r#""a" < "b" & "b" > "a""#),
      r#""a" &lt; "b" &amp; "b" &gt; "a""#
    );
  }

  #[test]
  fn attr_escapes_quotes() {
    assert_eq!(
      escape_attr(r#""a" < 'b'"#),
      "&quot;a&quot; &lt; &#39;b&#39;"
    );
  }

  proptest! {
    #[test]
    fn escaped_text_has_no_markup(value in ".*") {
      let escaped = escape_attr(&value);
      prop_assert!(!escaped.contains(['<', '>', '"', '\'']));
      let unescaped = escaped
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
      prop_assert_eq!(unescaped, value);
    }
  }
}
