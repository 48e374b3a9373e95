//! Human-facing HTML pages and the viewer client, compiled into the binary.

/// Embedded page and asset sources.
mod embedded {
    pub const INDEX: &str = include_str!("embedded/index.html");
    pub const CONNECT: &str = include_str!("embedded/connect.html");
    pub const JOIN: &str = include_str!("embedded/join.html");

    pub const STREAMER_JS: &str = include_str!("embedded/streamer.js");
    pub const CONNECT_JS: &str = include_str!("embedded/connect.js");
    pub const MIRROR_CSS: &str = include_str!("embedded/mirror.css");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Page {
    Index,
    /// Shown to the host; links to the join page.
    Connect,
    /// Shown to viewers; opens the listener stream.
    Join,
}

impl Page {
    fn source(&self) -> &'static str {
        match self {
            Page::Index => embedded::INDEX,
            Page::Connect => embedded::CONNECT,
            Page::Join => embedded::JOIN,
        }
    }

    /// Render with `url` substituted for `{{url}}` (HTML-escaped) and
    /// `{{url_json}}` (a JavaScript string literal).
    pub fn render(&self, url: &str) -> String {
        self.source()
            .replace("{{url_json}}", &js_string(url))
            .replace("{{url}}", &escape_html(url))
    }
}

/// Static files the pages load from `/assets/{name}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Asset {
    /// Viewer client for the join page.
    StreamerJs,
    ConnectJs,
    MirrorCss,
}

impl Asset {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "streamer.js" => Some(Asset::StreamerJs),
            "connect.js" => Some(Asset::ConnectJs),
            "mirror.css" => Some(Asset::MirrorCss),
            _ => None,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Asset::StreamerJs | Asset::ConnectJs => "text/javascript; charset=utf-8",
            Asset::MirrorCss => "text/css; charset=utf-8",
        }
    }

    pub fn body(&self) -> &'static str {
        match self {
            Asset::StreamerJs => embedded::STREAMER_JS,
            Asset::ConnectJs => embedded::CONNECT_JS,
            Asset::MirrorCss => embedded::MIRROR_CSS,
        }
    }
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn js_string(raw: &str) -> String {
    // A JSON string is a valid JS literal; `</` must not close the script tag.
    serde_json::Value::String(raw.to_string())
        .to_string()
        .replace("</", "<\\/")
}
