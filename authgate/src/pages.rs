//! HTML for the sign-in surface. Deliberately plain; styling lives in the
//! embedded stylesheet.

use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::response::{Html, IntoResponse, Response};

/// Files served under `{prefix}/static/`.
const ASSETS: &[(&str, &str, &str)] = &[
    ("style.css", "text/css; charset=utf-8", include_str!("../assets/style.css")),
    ("favicon.svg", "image/svg+xml", include_str!("../assets/favicon.svg")),
];

pub fn asset(path: &str) -> Option<Response> {
    let (_, content_type, body) = ASSETS.iter().find(|(name, _, _)| *name == path)?;
    Some(
        (
            [
                (CONTENT_TYPE, *content_type),
                (CACHE_CONTROL, "public, max-age=3600"),
            ],
            *body,
        )
            .into_response(),
    )
}

pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            c => out.push(c),
        }
    }
    out
}

fn layout(prefix: &str, title: &str, content: &str) -> Html<String> {
    Html(format!(
        "<!doctype html><html lang=\"en\"><head><meta charset=\"utf-8\">\
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\
         <title>{title}</title>\
         <link rel=\"icon\" href=\"{prefix}/static/favicon.svg\">\
         <link rel=\"stylesheet\" href=\"{prefix}/static/style.css\"></head>\
         <body><main><h1>{title}</h1>{content}</main></body></html>",
        title = escape_html(title),
    ))
}

fn otp_form(prefix: &str) -> String {
    format!(
        "<form method=\"post\" action=\"{prefix}/email/verify-otp\">\
         <label for=\"otp\">Sign-in code</label>\
         <input id=\"otp\" name=\"otp\" autocomplete=\"one-time-code\" placeholder=\"ABCD-EFGH-IJKL\" required>\
         <button type=\"submit\">Verify code</button></form>"
    )
}

/// What the login page offers.
pub struct LoginPage<'a> {
    pub prefix: &'a str,
    pub title: &'a str,
    /// `(name, label)` per OAuth provider.
    pub providers: Vec<(&'a str, &'a str)>,
    pub email: bool,
    pub password: bool,
}

impl LoginPage<'_> {
    pub fn render(&self) -> Html<String> {
        let prefix = self.prefix;
        let mut content = String::new();

        if !self.providers.is_empty() {
            content.push_str("<section class=\"providers\">");
            for (name, label) in &self.providers {
                content.push_str(&format!(
                    "<a class=\"button\" href=\"{prefix}/oauth2/start/{}\">Continue with {}</a>",
                    urlencoding::encode(name),
                    escape_html(label)
                ));
            }
            content.push_str("</section>");
        }

        if self.email {
            content.push_str(&format!(
                "<section><form method=\"post\" action=\"{prefix}/email/send\">\
                 <label for=\"email\">Email</label>\
                 <input id=\"email\" name=\"email\" type=\"email\" autocomplete=\"email\" required>\
                 <button type=\"submit\">Email me a sign-in link</button></form>\
                 <details><summary>I have a code</summary>{}</details></section>",
                otp_form(prefix)
            ));
        }

        if self.password {
            content.push_str(&format!(
                "<section><form method=\"post\" action=\"{prefix}/password/login\">\
                 <label for=\"password\">Password</label>\
                 <input id=\"password\" name=\"password\" type=\"password\" autocomplete=\"current-password\" required>\
                 <button type=\"submit\">Sign in</button></form></section>"
            ));
        }

        layout(prefix, self.title, &content)
    }
}

/// Shown after a sign-in email was requested, whether or not one was sent.
pub fn check_inbox(prefix: &str) -> Html<String> {
    let content = format!(
        "<p>If that address may sign in, a link and a code are on their way. \
         Both expire shortly.</p>{}",
        otp_form(prefix)
    );
    layout(prefix, "Check your inbox", &content)
}
