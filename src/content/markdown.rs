use ego_tree::NodeRef;
use regex::Regex;
use scraper::node::Node;
use scraper::{Html, Selector};
use std::sync::OnceLock;

/// Elements whose subtrees never contribute to readable content.
const DENY_ELEMENTS: &[&str] = &[
    "script", "style", "noscript", "iframe", "object", "embed", "nav", "header", "footer",
    "aside", "button", "form", "select", "svg",
];

/// Class/id tokens marking navigation chrome, ads, social widgets, and
/// cookie banners.
const DENY_CLASS_TOKENS: &[&str] = &[
    "nav",
    "navbar",
    "sidebar",
    "menu",
    "ad",
    "ads",
    "advert",
    "advertisement",
    "banner",
    "social",
    "share",
    "sharing",
    "button",
    "btn",
    "cookie",
    "cookies",
    "cookie-banner",
    "cookie-consent",
    "cookie-notice",
    "gdpr",
    "consent",
    "newsletter",
    "popup",
    "modal",
];

fn boilerplate_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(cookie policy|privacy policy|terms of service|accept (all )?cookies|we use cookies|subscribe to our newsletter|sign up for our newsletter|follow us on|all rights reserved)",
        )
        .expect("valid regex")
    })
}

/// Convert an HTML document to Markdown: `# title`, italicized meta
/// description, then a structural walk of the body with chrome, ads, and
/// cookie banners stripped.
pub fn html_to_markdown(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut out = String::new();

    if let Some(title) = first_text(&document, "title") {
        out.push_str(&format!("# {title}\n\n"));
    }
    if let Some(desc) = meta_description(&document) {
        out.push_str(&format!("*{desc}*\n\n"));
    }

    let body_sel = Selector::parse("body").expect("valid selector");
    if let Some(body) = document.select(&body_sel).next() {
        render_children(*body, &mut out);
    }

    postprocess(&out)
}

fn first_text(document: &Html, selector: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    let text = document
        .select(&sel)
        .next()?
        .text()
        .collect::<String>()
        .trim()
        .to_string();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn meta_description(document: &Html) -> Option<String> {
    let sel = Selector::parse(r#"meta[name="description"]"#).ok()?;
    let content = document
        .select(&sel)
        .next()?
        .value()
        .attr("content")?
        .trim()
        .to_string();
    if content.is_empty() {
        None
    } else {
        Some(content)
    }
}

fn is_denied(element: &scraper::node::Element) -> bool {
    let name = element.name();
    if DENY_ELEMENTS.contains(&name) {
        return true;
    }

    let class_hit = element
        .classes()
        .any(|class| DENY_CLASS_TOKENS.contains(&class.to_lowercase().as_str()));
    if class_hit {
        return true;
    }

    matches!(element.id(), Some(id) if DENY_CLASS_TOKENS.contains(&id.to_lowercase().as_str()))
}

fn render_children(node: NodeRef<Node>, out: &mut String) {
    for child in node.children() {
        render_node(child, out);
    }
}

fn render_node(node: NodeRef<Node>, out: &mut String) {
    match node.value() {
        Node::Text(text) => {
            let collapsed = collapse_whitespace(text);
            if !collapsed.trim().is_empty() {
                out.push_str(&collapsed);
            }
        }
        Node::Element(element) => {
            if is_denied(element) {
                return;
            }
            match element.name() {
                "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                    let level = element.name()[1..].parse::<usize>().unwrap_or(1);
                    let text = inline_text(node);
                    if !text.is_empty() {
                        out.push_str(&format!("\n\n{} {}\n\n", "#".repeat(level), text));
                    }
                }
                "p" => {
                    let mut inner = String::new();
                    render_children(node, &mut inner);
                    let inner = inner.trim();
                    if !inner.is_empty() {
                        out.push_str(&format!("\n\n{inner}\n\n"));
                    }
                }
                "br" => out.push('\n'),
                "strong" | "b" => {
                    let text = inline_text(node);
                    if !text.is_empty() {
                        out.push_str(&format!("**{text}**"));
                    }
                }
                "em" | "i" => {
                    let text = inline_text(node);
                    if !text.is_empty() {
                        out.push_str(&format!("*{text}*"));
                    }
                }
                "code" => {
                    let text = raw_text(node);
                    let text = text.trim();
                    if !text.is_empty() {
                        out.push_str(&format!("`{text}`"));
                    }
                }
                "pre" => {
                    let text = raw_text(node);
                    let text = text.trim_matches('\n');
                    if !text.is_empty() {
                        out.push_str(&format!("\n\n```\n{text}\n```\n\n"));
                    }
                }
                "blockquote" => {
                    let mut inner = String::new();
                    render_children(node, &mut inner);
                    let quoted: String = inner
                        .trim()
                        .lines()
                        .map(|line| format!("> {}\n", line.trim()))
                        .collect();
                    if !quoted.is_empty() {
                        out.push_str(&format!("\n\n{quoted}\n"));
                    }
                }
                "ul" => render_list(node, out, false),
                "ol" => render_list(node, out, true),
                "a" => {
                    let text = inline_text(node);
                    let href = element.attr("href").unwrap_or("").trim();
                    if !text.is_empty() && !href.is_empty() {
                        out.push_str(&format!("[{text}]({href})"));
                    } else if !text.is_empty() {
                        out.push_str(&text);
                    }
                }
                "img" => {
                    let src = element.attr("src").unwrap_or("").trim();
                    let alt = element.attr("alt").unwrap_or("").trim();
                    let lazy = element.attr("data-src").is_some();
                    if !src.is_empty() && !src.starts_with("data:") && !lazy && !alt.is_empty() {
                        out.push_str(&format!("![{alt}]({src})"));
                    }
                }
                "table" => render_table(node, out),
                // Transparent containers: recurse.
                _ => render_children(node, out),
            }
        }
        _ => {}
    }
}

fn render_list(node: NodeRef<Node>, out: &mut String, ordered: bool) {
    out.push_str("\n\n");
    let mut index = 0usize;
    for child in node.children() {
        let Node::Element(element) = child.value() else {
            continue;
        };
        if element.name() != "li" || is_denied(element) {
            continue;
        }
        index += 1;
        let mut inner = String::new();
        render_children(child, &mut inner);
        let inner = collapse_whitespace(&inner);
        let inner = inner.trim();
        if inner.is_empty() {
            continue;
        }
        if ordered {
            out.push_str(&format!("{index}. {inner}\n"));
        } else {
            out.push_str(&format!("- {inner}\n"));
        }
    }
    out.push('\n');
}

fn render_table(node: NodeRef<Node>, out: &mut String) {
    let mut rows: Vec<Vec<String>> = Vec::new();
    collect_table_rows(node, &mut rows);
    if rows.is_empty() {
        return;
    }

    out.push_str("\n\n");
    for (i, row) in rows.iter().enumerate() {
        out.push_str(&format!("| {} |\n", row.join(" | ")));
        if i == 0 {
            let sep: Vec<&str> = row.iter().map(|_| "---").collect();
            out.push_str(&format!("| {} |\n", sep.join(" | ")));
        }
    }
    out.push('\n');
}

fn collect_table_rows(node: NodeRef<Node>, rows: &mut Vec<Vec<String>>) {
    for child in node.children() {
        let Node::Element(element) = child.value() else {
            continue;
        };
        match element.name() {
            "tr" => {
                let cells: Vec<String> = child
                    .children()
                    .filter_map(|cell| {
                        let Node::Element(cell_el) = cell.value() else {
                            return None;
                        };
                        if matches!(cell_el.name(), "td" | "th") {
                            Some(collapse_whitespace(&inline_text(cell)).trim().to_string())
                        } else {
                            None
                        }
                    })
                    .collect();
                if !cells.is_empty() {
                    rows.push(cells);
                }
            }
            "thead" | "tbody" | "tfoot" => collect_table_rows(child, rows),
            _ => {}
        }
    }
}

/// Flatten a subtree into single-line inline text (denied subtrees skipped).
fn inline_text(node: NodeRef<Node>) -> String {
    let mut buf = String::new();
    collect_inline(node, &mut buf);
    collapse_whitespace(&buf).trim().to_string()
}

fn collect_inline(node: NodeRef<Node>, buf: &mut String) {
    for child in node.children() {
        match child.value() {
            Node::Text(text) => buf.push_str(text),
            Node::Element(element) => {
                if !is_denied(element) {
                    collect_inline(child, buf);
                }
            }
            _ => {}
        }
    }
}

/// Raw text with original whitespace, for code blocks.
fn raw_text(node: NodeRef<Node>) -> String {
    let mut buf = String::new();
    collect_raw(node, &mut buf);
    buf
}

fn collect_raw(node: NodeRef<Node>, buf: &mut String) {
    for child in node.children() {
        match child.value() {
            Node::Text(text) => buf.push_str(text),
            Node::Element(_) => collect_raw(child, buf),
            _ => {}
        }
    }
}

fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_ws = false;
    for c in text.chars() {
        if c.is_whitespace() {
            if !last_ws {
                out.push(' ');
            }
            last_ws = true;
        } else {
            out.push(c);
            last_ws = false;
        }
    }
    out
}

/// Final cleanup: drop boilerplate lines, collapse space runs outside code
/// fences, and squeeze 3+ newlines down to blank-line separation.
fn postprocess(markdown: &str) -> String {
    static SPACES: OnceLock<Regex> = OnceLock::new();
    static NEWLINES: OnceLock<Regex> = OnceLock::new();
    let spaces = SPACES.get_or_init(|| Regex::new(r"[ \t]{2,}").expect("valid regex"));
    let newlines = NEWLINES.get_or_init(|| Regex::new(r"\n{3,}").expect("valid regex"));

    let mut kept = String::new();
    let mut in_fence = false;
    for line in markdown.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            kept.push_str(line);
            kept.push('\n');
            continue;
        }
        if in_fence {
            kept.push_str(line);
            kept.push('\n');
            continue;
        }
        if boilerplate_re().is_match(line) {
            continue;
        }
        let line = spaces.replace_all(line.trim_end(), " ");
        kept.push_str(&line);
        kept.push('\n');
    }

    let squeezed = newlines.replace_all(&kept, "\n\n");
    let trimmed = squeezed.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}\n")
    }
}
