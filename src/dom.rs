use headless_chrome::Tab;
use std::sync::Arc;

use crate::types::DOM_SNAPSHOT_MAX_CHARS;

/// JavaScript injected into the page to produce a compact outline of what the
/// model can interact with. Reads the DOM without touching layout.
///
/// Interactive elements (a, button, input, textarea, select) get sequential
/// `data-eid` attributes `[e0]`, `[e1]`, ... so the model can target them
/// with `[data-eid="[eN]"]`. Short leaf text nodes are listed between them.
const OUTLINE_JS: &str = r#"
(() => {
  const SKIP = new Set(['SCRIPT','STYLE','NOSCRIPT','SVG','LINK']);
  let id = 0;
  const lines = [];
  const seen = new Set();

  function isVisible(el) {
    if (el.offsetParent === null && el.tagName !== 'BODY' && el.tagName !== 'HTML') return false;
    const s = getComputedStyle(el);
    return s.display !== 'none' && s.visibility !== 'hidden' && s.opacity !== '0';
  }

  function describe(el, eid, tag) {
    const text = (el.textContent || '').trim().slice(0, 60);
    switch (tag) {
      case 'a': return eid + ' link "' + text + '"';
      case 'button': return eid + ' button "' + text + '"';
      case 'select':
        return eid + ' select [' + [...el.options].map(o => o.text.trim().slice(0, 20)).join('|') + ']';
      default: {
        let d = eid + ' ' + tag + ' type=' + (el.type || 'text') + ' placeholder="' + (el.placeholder || '') + '"';
        if (el.name) d += ' name=' + el.name;
        return d;
      }
    }
  }

  function walk(node, depth) {
    if (depth > 15) return;
    for (const child of node.children) {
      if (SKIP.has(child.tagName) || !isVisible(child)) continue;
      const tag = child.tagName.toLowerCase();
      let line = null;
      if (['a','button','input','textarea','select'].includes(tag)) {
        const eid = '[e' + (id++) + ']';
        child.setAttribute('data-eid', eid);
        line = describe(child, eid, tag);
      } else if (child.children.length === 0) {
        const text = (child.textContent || '').trim();
        if (text.length > 2 && text.length < 200) line = '  "' + text.slice(0, 100) + '"';
      }
      if (line && !seen.has(line)) {
        seen.add(line);
        lines.push(line);
      }
      walk(child, depth + 1);
    }
  }

  if (document.body) walk(document.body, 0);
  return lines.join('\n');
})()
"#;

const CONTENT_LENGTH_JS: &str = "document.documentElement ? document.documentElement.outerHTML.length : 0";

/// Capture the interactive outline of the current page, truncated.
pub fn capture_outline(tab: &Arc<Tab>) -> anyhow::Result<String> {
    let raw = evaluate_string(tab, OUTLINE_JS)?.unwrap_or_default();
    Ok(truncate_outline(raw))
}

/// Size of the serialized document, in characters.
pub fn content_length(tab: &Arc<Tab>) -> anyhow::Result<usize> {
    let result = tab.evaluate(CONTENT_LENGTH_JS, false)?;
    Ok(result
        .value
        .and_then(|v| v.as_u64())
        .map(|n| n as usize)
        .unwrap_or(0))
}

/// Get the current page title.
pub fn page_title(tab: &Arc<Tab>) -> anyhow::Result<String> {
    Ok(evaluate_string(tab, "document.title")?.unwrap_or_else(|| "untitled".to_string()))
}

fn evaluate_string(tab: &Arc<Tab>, script: &str) -> anyhow::Result<Option<String>> {
    let result = tab.evaluate(script, false)?;
    Ok(result.value.and_then(|v| v.as_str().map(String::from)))
}

fn truncate_outline(raw: String) -> String {
    if raw.chars().count() <= DOM_SNAPSHOT_MAX_CHARS {
        return raw;
    }
    let total = raw.chars().count();
    let head: String = raw.chars().take(DOM_SNAPSHOT_MAX_CHARS).collect();
    format!("{head}\n... [truncated, {total} total chars]")
}
