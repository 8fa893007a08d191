use std::collections::{BTreeSet, HashSet};

use crate::input::{
    EventInput, OccurrenceInput, OrganizationInput, PlaceInput, SourceInput, VirtualLocationInput,
};

/// Trims every string field, drops blank optionals and canonicalizes keywords
/// so that storage and hashing see one spelling of the same listing.
pub fn normalize_input(input: EventInput) -> EventInput {
    EventInput {
        name: input.name.trim().to_owned(),
        description: clean(input.description),
        start_date: clean(input.start_date),
        end_date: clean(input.end_date),
        location: input.location.map(normalize_place),
        virtual_location: input
            .virtual_location
            .map(|v| VirtualLocationInput {
                url: v.url.trim().to_owned(),
                name: clean(v.name),
            })
            .filter(|v| !v.url.is_empty()),
        organizer: input
            .organizer
            .map(normalize_organization)
            .filter(|o| !o.name.is_empty() || o.id.is_some()),
        image: clean(input.image),
        url: clean(input.url),
        keywords: normalize_keywords(input.keywords),
        license: clean(input.license),
        event_domain: clean(input.event_domain),
        occurrences: input
            .occurrences
            .into_iter()
            .map(|o| OccurrenceInput {
                start_date: o.start_date.trim().to_owned(),
                end_date: clean(o.end_date),
                timezone: clean(o.timezone),
                venue_id: clean(o.venue_id),
                virtual_url: clean(o.virtual_url),
            })
            .collect(),
        source: input.source.map(|s| SourceInput {
            name: s.name.trim().to_owned(),
            url: s.url.trim().to_owned(),
            event_id: clean(s.event_id),
            license: clean(s.license),
            trust_level: s.trust_level,
        }),
    }
}

fn normalize_place(place: PlaceInput) -> PlaceInput {
    PlaceInput {
        id: clean(place.id),
        name: place.name.trim().to_owned(),
        street_address: clean(place.street_address),
        address_locality: clean(place.address_locality),
        address_region: clean(place.address_region),
        postal_code: clean(place.postal_code),
        address_country: clean(place.address_country),
        latitude: place.latitude,
        longitude: place.longitude,
    }
}

fn normalize_organization(org: OrganizationInput) -> OrganizationInput {
    OrganizationInput {
        id: clean(org.id),
        name: org.name.trim().to_owned(),
        url: clean(org.url),
        email: clean(org.email),
        address_locality: clean(org.address_locality),
        address_region: clean(org.address_region),
    }
}

fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}

// Lower-cased, de-duplicated and sorted.
fn normalize_keywords(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

pub fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Lower-case, `&` becomes `and`, punctuation stripped, whitespace collapsed.
/// "The Rex Hotel & Jazz Bar" and "the rex hotel and jazz bar!" share a key.
pub fn normalize_name(name: &str) -> String {
    let lowered = name.to_lowercase().replace('&', " and ");
    let stripped: String = lowered
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect();
    collapse_whitespace(&stripped)
}

/// Trigram similarity with the semantics of pg_trgm's `similarity()`:
/// words are padded with two leading blanks and one trailing blank, and the
/// score is the Jaccard index of the two trigram sets.
pub fn trigram_similarity(a: &str, b: &str) -> f64 {
    let left = trigrams(a);
    let right = trigrams(b);
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }

    let shared = left.intersection(&right).count();
    let union = left.len() + right.len() - shared;
    shared as f64 / union as f64
}

fn trigrams(value: &str) -> HashSet<[char; 3]> {
    let mut set = HashSet::new();
    let lowered = value.to_lowercase();
    for word in lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let padded: Vec<char> = "  "
            .chars()
            .chain(word.chars())
            .chain(std::iter::once(' '))
            .collect();
        for window in padded.windows(3) {
            set.insert([window[0], window[1], window[2]]);
        }
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_name_handles_ampersand_and_punctuation() {
        assert_eq!(
            normalize_name("  The Rex Hotel & Jazz-Bar! "),
            "the rex hotel and jazzbar"
        );
        assert_eq!(
            normalize_name("the rex   hotel and jazzbar"),
            "the rex hotel and jazzbar"
        );
    }

    #[test]
    fn test_trigram_similarity() {
        assert_eq!(trigram_similarity("massey hall", "massey hall"), 1.0);
        assert_eq!(trigram_similarity("", "massey hall"), 0.0);

        let close = trigram_similarity("the rex hotel jazz bar", "rex hotel jazz bar");
        assert!(close > 0.8, "got {close}");

        let far = trigram_similarity("massey hall", "roy thomson hall");
        assert!(far < 0.4, "got {far}");
    }

    #[test]
    fn test_normalize_input_trims_and_drops_blanks() {
        let input = EventInput {
            name: "  Jazz Night ".to_owned(),
            description: Some("   ".to_owned()),
            keywords: vec![
                "Jazz".to_owned(),
                " jazz".to_owned(),
                "Live Music".to_owned(),
                "".to_owned(),
            ],
            organizer: Some(OrganizationInput {
                name: "   ".to_owned(),
                ..Default::default()
            }),
            ..Default::default()
        };

        let normalized = normalize_input(input);
        assert_eq!(normalized.name, "Jazz Night");
        assert_eq!(normalized.description, None);
        assert_eq!(normalized.keywords, vec!["jazz", "live music"]);
        assert_eq!(normalized.organizer, None);
    }
}
