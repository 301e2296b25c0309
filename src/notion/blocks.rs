//! HTML body conversion into Notion block descriptors.
//!
//! Walks the HTML fragment the way mail clients render it: paragraphs,
//! headings, lists, quotes, code, tables, and images. `cid:` image
//! references are substituted with real upload handles from the supplied
//! map; everything else degrades to text. When nothing block-shaped can
//! be extracted the whole body falls back to a plain-text rendering.
//!
//! Every rich-text span is bounded to the remote store's per-span limit
//! of 2,000 UTF-16 code units, and page bodies are split into batches of
//! at most 100 blocks per request.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Node};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Per-span limit, in UTF-16 code units.
pub const MAX_TEXT_UNITS: usize = 2000;
/// Per-request limit on block children.
pub const MAX_BLOCKS_PER_REQUEST: usize = 100;

static CID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"cid:([^"'\s>]+)"#).expect("valid cid pattern"));

/// Content ids referenced from `cid:` URLs inside an HTML body.
pub fn cid_references(html: &str) -> HashSet<String> {
    CID_PATTERN
        .captures_iter(html)
        .map(|c| c[1].to_string())
        .collect()
}

/// Truncate on a UTF-16 code-unit boundary. Surrogate pairs are never
/// split: a character that does not fit entirely is dropped.
pub fn truncate_utf16(text: &str, max_units: usize) -> String {
    let total: usize = text.chars().map(char::len_utf16).sum();
    if total <= max_units {
        return text.to_string();
    }
    let mut used = 0;
    let mut out = String::new();
    for ch in text.chars() {
        let width = ch.len_utf16();
        if used + width > max_units {
            break;
        }
        used += width;
        out.push(ch);
    }
    out
}

/// One bounded rich-text span.
pub fn rich_text(text: &str) -> Value {
    json!([{ "text": { "content": truncate_utf16(text, MAX_TEXT_UNITS) } }])
}

pub fn paragraph(text: &str) -> Value {
    json!({
        "object": "block",
        "type": "paragraph",
        "paragraph": { "rich_text": rich_text(text) }
    })
}

pub fn heading(level: u8, text: &str) -> Value {
    let kind = match level {
        1 => "heading_1",
        2 => "heading_2",
        _ => "heading_3",
    };
    let mut block = json!({ "object": "block", "type": kind });
    block[kind] = json!({ "rich_text": rich_text(text) });
    block
}

pub fn bulleted_item(text: &str) -> Value {
    json!({
        "object": "block",
        "type": "bulleted_list_item",
        "bulleted_list_item": { "rich_text": rich_text(text) }
    })
}

pub fn numbered_item(text: &str) -> Value {
    json!({
        "object": "block",
        "type": "numbered_list_item",
        "numbered_list_item": { "rich_text": rich_text(text) }
    })
}

pub fn quote(text: &str) -> Value {
    json!({
        "object": "block",
        "type": "quote",
        "quote": { "rich_text": rich_text(text) }
    })
}

pub fn code(text: &str) -> Value {
    json!({
        "object": "block",
        "type": "code",
        "code": { "rich_text": rich_text(text), "language": "plain text" }
    })
}

pub fn divider() -> Value {
    json!({ "object": "block", "type": "divider", "divider": {} })
}

pub fn callout(text: &str, emoji: &str) -> Value {
    json!({
        "object": "block",
        "type": "callout",
        "callout": {
            "rich_text": rich_text(text),
            "icon": { "emoji": emoji }
        }
    })
}

/// Image block referencing an upload handle.
pub fn image_upload(upload_id: &str, caption: &str) -> Value {
    json!({
        "object": "block",
        "type": "image",
        "image": {
            "type": "file_upload",
            "file_upload": { "id": upload_id },
            "caption": rich_text(caption)
        }
    })
}

/// File block referencing an upload handle.
pub fn file_upload(upload_id: &str, caption: &str) -> Value {
    json!({
        "object": "block",
        "type": "file",
        "file": {
            "type": "file_upload",
            "file_upload": { "id": upload_id },
            "caption": rich_text(caption)
        }
    })
}

/// Convert an HTML fragment into ordered block descriptors. `image_map`
/// maps content ids to upload handles for `cid:` substitution.
pub fn convert(html: &str, image_map: &HashMap<String, String>) -> Vec<Value> {
    if !looks_like_html(html) {
        return text_to_blocks(html);
    }

    let document = Html::parse_fragment(html);
    let mut blocks = Vec::new();
    walk_element(&document.root_element(), image_map, &mut blocks);

    if blocks.is_empty() {
        // Nothing block-shaped survived; degrade to a text rendering.
        let text = html2text::from_read(html.as_bytes(), 100);
        debug!("html produced no blocks, falling back to text rendering");
        return text_to_blocks(&text);
    }
    blocks
}

fn looks_like_html(content: &str) -> bool {
    let lowered = content.to_lowercase();
    lowered.contains('<')
        && (lowered.contains("<p")
            || lowered.contains("<div")
            || lowered.contains("<html")
            || lowered.contains("<body")
            || lowered.contains("<br")
            || lowered.contains("<table")
            || lowered.contains("<span"))
}

/// Plain text to paragraph blocks, one per blank-line-separated chunk.
pub fn text_to_blocks(text: &str) -> Vec<Value> {
    text.split("\n\n")
        .map(str::trim)
        .filter(|chunk| !chunk.is_empty())
        .map(paragraph)
        .collect()
}

fn walk_element(element: &ElementRef, image_map: &HashMap<String, String>, blocks: &mut Vec<Value>) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => {
                let text = text.trim();
                if !text.is_empty() {
                    blocks.push(paragraph(text));
                }
            }
            Node::Element(el) => {
                let Some(child_ref) = ElementRef::wrap(child) else {
                    continue;
                };
                match el.name() {
                    "script" | "style" | "head" => {}
                    "p" => {
                        for img in child_ref.select(&img_selector()) {
                            if let Some(block) = image_block(&img, image_map) {
                                blocks.push(block);
                            }
                        }
                        let text = collected_text(&child_ref);
                        if !text.is_empty() {
                            blocks.push(paragraph(&text));
                        }
                    }
                    "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                        let text = collected_text(&child_ref);
                        if !text.is_empty() {
                            let level = el.name().as_bytes()[1] - b'0';
                            blocks.push(heading(level, &text));
                        }
                    }
                    "ul" => {
                        for li in child_ref.select(&li_selector()) {
                            let text = collected_text(&li);
                            if !text.is_empty() {
                                blocks.push(bulleted_item(&text));
                            }
                        }
                    }
                    "ol" => {
                        for li in child_ref.select(&li_selector()) {
                            let text = collected_text(&li);
                            if !text.is_empty() {
                                blocks.push(numbered_item(&text));
                            }
                        }
                    }
                    "blockquote" => {
                        let text = collected_text(&child_ref);
                        if !text.is_empty() {
                            blocks.push(quote(&text));
                        }
                    }
                    "pre" | "code" => {
                        let text = collected_text(&child_ref);
                        if !text.is_empty() {
                            blocks.push(code(&text));
                        }
                    }
                    "img" => {
                        if let Some(block) = image_block(&child_ref, image_map) {
                            blocks.push(block);
                        }
                    }
                    "a" => {
                        let text = collected_text(&child_ref);
                        let href = child_ref.value().attr("href").unwrap_or("");
                        if !text.is_empty() && !href.is_empty() && href != text {
                            blocks.push(paragraph(&format!("{} ({})", text, href)));
                        } else if !text.is_empty() {
                            blocks.push(paragraph(&text));
                        }
                    }
                    "table" => {
                        if let Some(block) = table_block(&child_ref) {
                            blocks.push(block);
                        }
                    }
                    "br" | "hr" => {}
                    // Containers: recurse.
                    _ => walk_element(&child_ref, image_map, blocks),
                }
            }
            _ => {}
        }
    }
}

fn img_selector() -> scraper::Selector {
    scraper::Selector::parse("img").expect("valid selector")
}

fn li_selector() -> scraper::Selector {
    scraper::Selector::parse("li").expect("valid selector")
}

fn collected_text(element: &ElementRef) -> String {
    element
        .text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn image_block(img: &ElementRef, image_map: &HashMap<String, String>) -> Option<Value> {
    let src = img.value().attr("src")?;
    let alt = img.value().attr("alt").unwrap_or("");

    if let Some(cid) = src.strip_prefix("cid:") {
        let upload_id = lookup_cid(cid, image_map)?;
        return Some(image_upload(upload_id, alt));
    }
    if src.starts_with("https://") || src.starts_with("http://") {
        return Some(json!({
            "object": "block",
            "type": "image",
            "image": {
                "type": "external",
                "external": { "url": src },
                "caption": rich_text(alt)
            }
        }));
    }
    None
}

/// Content ids are matched exactly first, then without the `@domain`
/// suffix some clients append.
fn lookup_cid<'a>(cid: &str, image_map: &'a HashMap<String, String>) -> Option<&'a String> {
    if let Some(id) = image_map.get(cid) {
        return Some(id);
    }
    let bare = cid.split('@').next()?;
    image_map
        .iter()
        .find(|(key, _)| key.split('@').next() == Some(bare))
        .map(|(_, id)| id)
}

fn table_block(table: &ElementRef) -> Option<Value> {
    let row_selector = scraper::Selector::parse("tr").expect("valid selector");
    let cell_selector = scraper::Selector::parse("td, th").expect("valid selector");

    let mut rows = Vec::new();
    let mut width = 0;
    for tr in table.select(&row_selector) {
        let cells: Vec<String> = tr.select(&cell_selector).map(|c| collected_text(&c)).collect();
        if cells.is_empty() {
            continue;
        }
        width = width.max(cells.len());
        rows.push(cells);
    }
    if rows.is_empty() || width == 0 {
        return None;
    }

    let row_blocks: Vec<Value> = rows
        .into_iter()
        .map(|mut cells| {
            cells.resize(width, String::new());
            let cell_values: Vec<Value> = cells.iter().map(|c| rich_text(c)).collect();
            json!({
                "object": "block",
                "type": "table_row",
                "table_row": { "cells": cell_values }
            })
        })
        .collect();

    Some(json!({
        "object": "block",
        "type": "table",
        "table": {
            "table_width": width,
            "has_column_header": false,
            "has_row_header": false,
            "children": row_blocks
        }
    }))
}

/// Split children into the create-request batch and follow-on append
/// batches, each within the per-request limit.
pub fn chunk_children(children: Vec<Value>) -> (Vec<Value>, Vec<Vec<Value>>) {
    if children.len() <= MAX_BLOCKS_PER_REQUEST {
        return (children, Vec::new());
    }
    let mut iter = children.into_iter();
    let first: Vec<Value> = iter.by_ref().take(MAX_BLOCKS_PER_REQUEST).collect();
    let mut rest = Vec::new();
    let mut batch = Vec::new();
    for block in iter {
        batch.push(block);
        if batch.len() == MAX_BLOCKS_PER_REQUEST {
            rest.push(std::mem::take(&mut batch));
        }
    }
    if !batch.is_empty() {
        rest.push(batch);
    }
    (first, rest)
}
