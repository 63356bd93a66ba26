//-
// Copyright (c) 2024, Mailgather contributors
//
// This file is part of Mailgather.
//
// Mailgather is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Mailgather is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with Mailgather. If not, see <http://www.gnu.org/licenses/>.

//! Link extraction from HTML bodies.

use scraper::{Html, Selector};

/// Return the `href` of every anchor in `html`, in document order.
///
/// Duplicates are retained. The parser is forgiving, so malformed markup
/// yields whatever anchors could be recovered rather than an error.
pub fn extract_links(html: &str) -> Vec<String> {
    let selector = match Selector::parse("a[href]") {
        Ok(selector) => selector,
        Err(_) => return Vec::new(),
    };

    Html::parse_document(html)
        .select(&selector)
        .filter_map(|a| a.value().attr("href"))
        .map(|href| href.trim().to_owned())
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn finds_anchors_in_order() {
        let html = r#"<html><body>
            <p>Large attachment:
              <a href="https://mail.qq.com/cgi-bin/ftnExs_download?k=1">a.zip</a>
            </p>
            <a name="no-href">skip</a>
            <a href=" https://example.com/x ">x</a>
            <a href="https://mail.qq.com/cgi-bin/ftnExs_download?k=1">again</a>
            </body></html>"#;

        assert_eq!(
            vec![
                "https://mail.qq.com/cgi-bin/ftnExs_download?k=1",
                "https://example.com/x",
                "https://mail.qq.com/cgi-bin/ftnExs_download?k=1",
            ],
            extract_links(html)
        );
    }

    #[test]
    fn entities_are_decoded() {
        assert_eq!(
            vec!["https://dashi.163.com/a?key=1&x=2"],
            extract_links(r#"<a href="https://dashi.163.com/a?key=1&amp;x=2">"#)
        );
    }

    #[test]
    fn malformed_markup_is_tolerated() {
        assert_eq!(
            vec!["u"],
            extract_links("<div><a href=u>unclosed <table><tr>")
        );
        assert!(extract_links("").is_empty());
    }
}
