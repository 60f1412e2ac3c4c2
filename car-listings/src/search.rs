//! Listing query model shared by the owner-scoped fetch and the global search.
//!
//! A `CarQuery` is an AND of optional predicates (owner, id, keyword). The keyword
//! predicate is itself an OR over title, description and tags, matched as a
//! case-insensitive substring. Repositories evaluate it either in memory
//! (`CarQuery::matches`) or as SQL (`CarQuery::push_sql`).

use sqlx::{Postgres, QueryBuilder};
use uuid::Uuid;

use crate::models::Car;

/// Case-insensitive substring filter over a listing's text fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeywordFilter {
    needle: String,
}

impl KeywordFilter {
    /// Blank or absent keywords produce no filter.
    pub fn parse(raw: Option<&str>) -> Option<Self> {
        let trimmed = raw?.trim();
        if trimmed.is_empty() { return None; }
        Some(Self { needle: trimmed.to_lowercase() })
    }

    pub fn keyword(&self) -> &str { &self.needle }

    pub fn matches(&self, car: &Car) -> bool {
        let hit = |s: &str| s.to_lowercase().contains(&self.needle);
        hit(&car.title) || hit(&car.description) || car.tags.iter().any(|t| hit(t))
    }

    /// `ILIKE` pattern with the LIKE wildcards of the keyword escaped.
    pub fn like_pattern(&self) -> String {
        let mut escaped = String::with_capacity(self.needle.len() + 2);
        escaped.push('%');
        for c in self.needle.chars() {
            if matches!(c, '%' | '_' | '\\') { escaped.push('\\'); }
            escaped.push(c);
        }
        escaped.push('%');
        escaped
    }
}

#[derive(Debug, Clone, Default)]
pub struct CarQuery {
    pub owner_id: Option<Uuid>,
    pub car_id: Option<Uuid>,
    pub keyword: Option<KeywordFilter>,
}

impl CarQuery {
    /// Every listing, regardless of owner.
    pub fn everyone() -> Self { Self::default() }

    pub fn owned_by(owner_id: Uuid) -> Self { Self { owner_id: Some(owner_id), ..Self::default() } }

    pub fn with_car_id(mut self, car_id: Option<Uuid>) -> Self { self.car_id = car_id; self }

    pub fn with_keyword(mut self, keyword: Option<&str>) -> Self { self.keyword = KeywordFilter::parse(keyword); self }

    /// True when the query can match at most one listing.
    pub fn is_single(&self) -> bool { self.car_id.is_some() }

    pub fn matches(&self, car: &Car) -> bool {
        self.owner_id.map_or(true, |o| car.owner_id == o)
            && self.car_id.map_or(true, |id| car.id == id)
            && self.keyword.as_ref().map_or(true, |k| k.matches(car))
    }

    /// Append this query's predicates to a builder that already ends in a `WHERE TRUE` clause.
    pub fn push_sql(&self, qb: &mut QueryBuilder<'_, Postgres>) {
        if let Some(owner) = self.owner_id {
            qb.push(" AND c.owner_id = ").push_bind(owner);
        }
        if let Some(id) = self.car_id {
            qb.push(" AND c.id = ").push_bind(id);
        }
        if let Some(k) = &self.keyword {
            let pattern = k.like_pattern();
            qb.push(" AND (c.title ILIKE ").push_bind(pattern.clone());
            qb.push(" OR c.description ILIKE ").push_bind(pattern.clone());
            qb.push(" OR EXISTS (SELECT 1 FROM unnest(c.tags) AS t(tag) WHERE t.tag ILIKE ").push_bind(pattern);
            qb.push("))");
        }
    }
}
