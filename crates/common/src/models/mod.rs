//! Data model for the aggregation pipeline
//!
//! - `TopicQuery`: one entry of the configured topic table
//! - `SearchResponse` / `Paper` / `Author`: search provider payloads
//! - `Coordinates`: a validated latitude/longitude pair
//! - `VisualizationNode`: the geo-tagged output record

use serde::{Deserialize, Serialize};

/// Node `type` tag expected by the map frontend
pub const NODE_TYPE: &str = "semantic_scholar";

pub const UNTITLED_PAPER: &str = "Untitled Paper";
pub const NO_ABSTRACT: &str = "No abstract available";
pub const UNKNOWN_AUTHORS: &str = "Unknown Authors";
pub const UNKNOWN_PUBLICATION: &str = "Unknown";

/// Maps a topic label to the query string sent to the search provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicQuery {
    pub label: String,
    pub query: String,
}

impl TopicQuery {
    pub fn new(label: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            query: query.into(),
        }
    }
}

/// Paper search response (`{"data": [...]}`)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub data: Vec<Paper>,
}

/// One paper as returned by the search provider
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Paper {
    #[serde(default)]
    pub title: Option<String>,

    #[serde(rename = "abstract", default)]
    pub abstract_text: Option<String>,

    #[serde(default)]
    pub url: Option<String>,

    #[serde(default)]
    pub authors: Option<Vec<Author>>,

    #[serde(default)]
    pub year: Option<i32>,

    #[serde(rename = "publicationDate", default)]
    pub publication_date: Option<String>,
}

impl Paper {
    /// Authors with a non-empty name, comma-joined
    pub fn author_names(&self) -> String {
        let names: Vec<&str> = self
            .authors
            .iter()
            .flatten()
            .filter_map(|author| author.name.as_deref())
            .filter(|name| !name.is_empty())
            .collect();

        if names.is_empty() {
            UNKNOWN_AUTHORS.to_string()
        } else {
            names.join(", ")
        }
    }

    /// `publicationDate`, else `year`, else "Unknown"
    pub fn publication_label(&self) -> String {
        match (self.publication_date.as_deref(), self.year) {
            (Some(date), _) if !date.is_empty() => date.to_string(),
            (_, Some(year)) => year.to_string(),
            _ => UNKNOWN_PUBLICATION.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Author {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub affiliations: Option<Vec<String>>,
}

/// Geographic coordinates in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinates {
    /// Returns `None` unless both values are finite and within range
    pub fn new(lat: f64, lng: f64) -> Option<Self> {
        let valid = lat.is_finite()
            && lng.is_finite()
            && (-90.0..=90.0).contains(&lat)
            && (-180.0..=180.0).contains(&lng);
        valid.then_some(Self { lat, lng })
    }

    /// Parse a textual pair such as the one returned by the geocoding provider
    pub fn parse(lat: &str, lng: &str) -> Option<Self> {
        let lat = lat.trim().parse::<f64>().ok()?;
        let lng = lng.trim().parse::<f64>().ok()?;
        Self::new(lat, lng)
    }
}

/// Geo-tagged paper ready for the map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualizationNode {
    #[serde(rename = "type")]
    pub node_type: String,
    pub title: String,
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    pub summary: String,
    pub link: String,
    pub authors: String,
    pub published: String,
    pub topic: String,
    pub lat: f64,
    pub lng: f64,
}

impl VisualizationNode {
    /// Build a node from a paper whose affiliation resolved to `coords`
    pub fn from_paper(topic: &str, paper: &Paper, coords: Coordinates) -> Self {
        let abstract_text = paper
            .abstract_text
            .clone()
            .unwrap_or_else(|| NO_ABSTRACT.to_string());

        Self {
            node_type: NODE_TYPE.to_string(),
            title: paper
                .title
                .clone()
                .unwrap_or_else(|| UNTITLED_PAPER.to_string()),
            summary: abstract_text.clone(),
            abstract_text,
            link: paper.url.clone().unwrap_or_default(),
            authors: paper.author_names(),
            published: paper.publication_label(),
            topic: topic.to_string(),
            lat: coords.lat,
            lng: coords.lng,
        }
    }

    pub fn coordinates(&self) -> Coordinates {
        Coordinates {
            lat: self.lat,
            lng: self.lng,
        }
    }
}
