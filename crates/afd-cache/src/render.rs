use afd_cache_core::api_types::CachedProduct;
use time::format_description::well_known::Rfc3339;

const UNKNOWN: &str = "(unknown)";

pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Renders a cached product as an HTML fragment for the viewer page.
pub fn render_product_html(product: &CachedProduct) -> String {
    let issued = product
        .issued
        .as_deref()
        .map(escape_html)
        .unwrap_or_else(|| UNKNOWN.to_string());
    let updated = product
        .updated_at
        .format(&Rfc3339)
        .unwrap_or_else(|_| UNKNOWN.to_string());
    let product_id = product
        .product_id
        .as_deref()
        .map(escape_html)
        .unwrap_or_else(|| UNKNOWN.to_string());

    format!(
        r#"<div class="card">
  <h3 style="margin-top:0;">Forecast Discussion (Original)</h3>
  <div class="muted">
    Office: <b>{office}</b><br/>
    Issued: {issued}<br/>
    Cached/Updated: {updated}<br/>
    <small class="muted">Product: {product_id}</small>
  </div>
  <pre>{text}</pre>
</div>
"#,
        office = product.office,
        issued = issued,
        updated = updated,
        product_id = product_id,
        text = escape_html(&product.original_text),
    )
}
