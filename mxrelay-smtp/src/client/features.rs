//! ESMTP service extensions advertised in an EHLO reply.

use super::response::Response;

/// Keywords (and their parameters) offered by a server in its EHLO reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EsmtpFeatures {
    keywords: Vec<(String, Vec<String>)>,
}

impl EsmtpFeatures {
    /// Parse the extension lines of an EHLO reply.
    ///
    /// The first line is the server's greeting and carries no extension.
    #[must_use]
    pub fn from_ehlo(response: &Response) -> Self {
        Self::from_lines(response.lines.iter().skip(1).map(String::as_str))
    }

    pub fn from_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> Self {
        let keywords = lines
            .into_iter()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                let keyword = parts.next()?;

                // Legacy servers advertise `AUTH=LOGIN PLAIN`
                let (keyword, first) = keyword
                    .split_once('=')
                    .map_or((keyword, None), |(keyword, first)| (keyword, Some(first)));

                let params = first
                    .into_iter()
                    .chain(parts)
                    .filter(|param| !param.is_empty())
                    .map(str::to_string)
                    .collect();

                Some((keyword.to_ascii_uppercase(), params))
            })
            .collect();

        Self { keywords }
    }

    /// Whether `keyword` was advertised, compared case-insensitively.
    #[must_use]
    pub fn supports(&self, keyword: &str) -> bool {
        self.params(keyword).is_some()
    }

    /// Parameters of `keyword`, merged when the keyword appears more than once.
    #[must_use]
    pub fn params(&self, keyword: &str) -> Option<Vec<&str>> {
        let mut found = None::<Vec<&str>>;

        for (name, params) in &self.keywords {
            if name.eq_ignore_ascii_case(keyword) {
                found
                    .get_or_insert_with(Vec::new)
                    .extend(params.iter().map(String::as_str));
            }
        }

        found
    }

    /// The advertised maximum message size; `None` if absent or unlimited.
    #[must_use]
    pub fn max_size(&self) -> Option<u64> {
        self.params("SIZE")?
            .first()
            .and_then(|size| size.parse().ok())
            .filter(|&size| size > 0)
    }

    /// The upper-cased SASL mechanisms listed after `AUTH`.
    #[must_use]
    pub fn auth_mechanisms(&self) -> Vec<String> {
        let mut mechanisms = Vec::<String>::new();

        for mechanism in self.params("AUTH").unwrap_or_default() {
            let mechanism = mechanism.to_ascii_uppercase();
            if !mechanisms.contains(&mechanism) {
                mechanisms.push(mechanism);
            }
        }

        mechanisms
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty()
    }
}
