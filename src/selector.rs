use crate::catalog::{BEST, FormatCatalog};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QualityRequest {
    Best,
    Height(u32),
    Literal(String),
}

impl QualityRequest {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() || raw.eq_ignore_ascii_case(BEST) {
            return Self::Best;
        }

        let digits = raw.strip_suffix(['p', 'P']).unwrap_or(raw);
        match digits.parse::<u32>() {
            Ok(height) if height > 0 => Self::Height(height),
            _ => Self::Literal(raw.to_string()),
        }
    }

    /// Stable token used for cache fingerprints.
    pub fn token(&self) -> String {
        match self {
            Self::Best => BEST.to_string(),
            Self::Height(height) => height.to_string(),
            Self::Literal(literal) => literal.clone(),
        }
    }
}

/// Maps a quality request onto a catalog `format_id`.
///
/// A request naming an entry's `format_id` wins outright. A height picks the
/// entry minimising `(height > target, |height - target|)`, first in catalog
/// order on ties. Everything else, including an empty catalog, resolves to
/// `best`.
pub fn resolve(catalog: &FormatCatalog, request: &QualityRequest) -> String {
    if *request != QualityRequest::Best
        && let Some(entry) = catalog.get(&request.token())
    {
        return entry.format_id().to_string();
    }

    match request {
        QualityRequest::Height(target) => nearest_height(catalog, *target),
        QualityRequest::Best | QualityRequest::Literal(_) => BEST.to_string(),
    }
}

fn nearest_height(catalog: &FormatCatalog, target: u32) -> String {
    catalog
        .descriptors()
        .filter_map(|descriptor| descriptor.height.map(|height| (height, descriptor)))
        .min_by_key(|(height, _)| (*height > target, height.abs_diff(target)))
        .map(|(_, descriptor)| descriptor.format_id.clone())
        .unwrap_or_else(|| BEST.to_string())
}
