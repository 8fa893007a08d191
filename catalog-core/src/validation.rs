use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use url::Url;

use crate::config::IngestConfig;
use crate::error::IngestError;
use crate::input::EventInput;

#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedOccurrence {
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub timezone: String,
    /// External place identifier overriding the event venue.
    pub venue_ref: Option<String>,
    pub virtual_url: Option<String>,
}

/// The parsed schedule of a listing that passed validation.
/// Always holds at least one occurrence, ordered as submitted.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedEvent {
    pub occurrences: Vec<ValidatedOccurrence>,
}

impl ValidatedEvent {
    pub fn first_start(&self) -> DateTime<Utc> {
        self.occurrences
            .iter()
            .map(|o| o.start)
            .min()
            .unwrap_or_else(Utc::now)
    }

    /// Latest end across occurrences, if any declares one.
    pub fn last_end(&self) -> Option<DateTime<Utc>> {
        self.occurrences.iter().filter_map(|o| o.end).max()
    }
}

/// Checks a normalized input. Fails on the first problem found and has no side effects.
pub fn validate(input: &EventInput, config: &IngestConfig) -> Result<ValidatedEvent, IngestError> {
    if input.name.is_empty() {
        return Err(IngestError::validation("name", "is required"));
    }

    let default_timezone = parse_timezone("defaultTimezone", &config.default_timezone)?;

    let top_start = input
        .start_date
        .as_deref()
        .map(|raw| parse_timestamp("startDate", raw))
        .transpose()?;
    let top_end = input
        .end_date
        .as_deref()
        .map(|raw| parse_timestamp("endDate", raw))
        .transpose()?;
    if let (Some(start), Some(end)) = (top_start, top_end) {
        if end <= start {
            return Err(IngestError::validation("endDate", "must be after startDate"));
        }
    }

    let occurrences = if input.occurrences.is_empty() {
        let start = top_start
            .ok_or_else(|| IngestError::validation("startDate", "is required"))?;
        vec![ValidatedOccurrence {
            start,
            end: top_end,
            timezone: default_timezone.name().to_owned(),
            venue_ref: None,
            virtual_url: None,
        }]
    } else {
        let mut occurrences = Vec::with_capacity(input.occurrences.len());
        for (i, occurrence) in input.occurrences.iter().enumerate() {
            let field = |name: &str| format!("occurrences[{i}].{name}");

            if occurrence.start_date.is_empty() {
                return Err(IngestError::validation(&field("startDate"), "is required"));
            }
            let start = parse_timestamp(&field("startDate"), &occurrence.start_date)?;
            let end = occurrence
                .end_date
                .as_deref()
                .map(|raw| parse_timestamp(&field("endDate"), raw))
                .transpose()?;
            if let Some(end) = end {
                if end <= start {
                    return Err(IngestError::validation(
                        &field("endDate"),
                        "must be after startDate",
                    ));
                }
            }
            let timezone = match occurrence.timezone.as_deref() {
                Some(tz) => parse_timezone(&field("timezone"), tz)?,
                None => default_timezone,
            };
            if let Some(url) = occurrence.virtual_url.as_deref() {
                parse_http_url(&field("virtualUrl"), url)?;
            }

            occurrences.push(ValidatedOccurrence {
                start,
                end,
                timezone: timezone.name().to_owned(),
                venue_ref: occurrence.venue_id.clone(),
                virtual_url: occurrence.virtual_url.clone(),
            });
        }
        occurrences
    };

    match (&input.location, &input.virtual_location) {
        (None, None) => {
            return Err(IngestError::validation(
                "location",
                "a venue or a virtual location is required",
            ))
        }
        (Some(place), _) if place.name.is_empty() && place.id.is_none() => {
            return Err(IngestError::validation("location.name", "is required"))
        }
        _ => {}
    }

    if let Some(virtual_location) = &input.virtual_location {
        parse_http_url("virtualLocation.url", &virtual_location.url)?;
    }
    if let Some(image) = input.image.as_deref() {
        parse_http_url("image", image)?;
    }
    if let Some(url) = input.url.as_deref() {
        parse_http_url("url", url)?;
    }
    if let Some(source) = &input.source {
        if source.name.is_empty() {
            return Err(IngestError::validation("source.name", "is required"));
        }
        parse_http_url("source.url", &source.url)?;
        if let Some(trust) = source.trust_level {
            if !(1..=10).contains(&trust) {
                return Err(IngestError::validation(
                    "source.trustLevel",
                    "must be between 1 and 10",
                ));
            }
        }
    }

    Ok(ValidatedEvent { occurrences })
}

fn parse_timestamp(field: &str, raw: &str) -> Result<DateTime<Utc>, IngestError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| IngestError::validation(field, format!("is not an RFC 3339 timestamp: {e}")))
}

fn parse_timezone(field: &str, raw: &str) -> Result<Tz, IngestError> {
    raw.parse::<Tz>()
        .map_err(|_| IngestError::validation(field, format!("{raw} is not an IANA timezone")))
}

fn parse_http_url(field: &str, raw: &str) -> Result<Url, IngestError> {
    let url = Url::parse(raw)
        .map_err(|e| IngestError::validation(field, format!("is not a valid URL: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(IngestError::validation(
            field,
            format!("unsupported scheme {scheme}"),
        )),
    }
}

/// `scheme://host[:port]` of a source URL, used as the source's identity.
pub fn base_url(raw: &str) -> Result<String, IngestError> {
    let url = parse_http_url("source.url", raw)?;
    let host = url
        .host_str()
        .ok_or_else(|| IngestError::validation("source.url", "has no host"))?;
    Ok(match url.port() {
        Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
        None => format!("{}://{}", url.scheme(), host),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::{OccurrenceInput, PlaceInput, VirtualLocationInput};

    fn base_input() -> EventInput {
        EventInput {
            name: "Jazz Night".to_owned(),
            start_date: Some("2026-05-01T19:00:00-04:00".to_owned()),
            location: Some(PlaceInput {
                name: "Massey Hall".to_owned(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn field_of(err: IngestError) -> String {
        match err {
            IngestError::Validation { field, .. } => field,
            other => panic!("expected a validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_single_occurrence_shorthand() {
        let validated = validate(&base_input(), &IngestConfig::default()).unwrap();

        assert_eq!(validated.occurrences.len(), 1);
        let occurrence = &validated.occurrences[0];
        assert_eq!(occurrence.timezone, "America/Toronto");
        assert_eq!(
            occurrence.start,
            DateTime::parse_from_rfc3339("2026-05-01T23:00:00Z").unwrap()
        );
    }

    #[test]
    fn test_missing_fields_are_reported_by_name() {
        let config = IngestConfig::default();

        let mut input = base_input();
        input.name = String::new();
        assert_eq!(field_of(validate(&input, &config).unwrap_err()), "name");

        let mut input = base_input();
        input.start_date = None;
        assert_eq!(field_of(validate(&input, &config).unwrap_err()), "startDate");

        let mut input = base_input();
        input.location = None;
        assert_eq!(field_of(validate(&input, &config).unwrap_err()), "location");

        input.virtual_location = Some(VirtualLocationInput {
            url: "https://stream.example.com/jazz".to_owned(),
            name: None,
        });
        assert!(validate(&input, &config).is_ok());
    }

    #[test]
    fn test_end_must_follow_start() {
        let config = IngestConfig::default();

        let mut input = base_input();
        input.end_date = Some("2026-05-01T19:00:00-04:00".to_owned());
        assert_eq!(field_of(validate(&input, &config).unwrap_err()), "endDate");

        let mut input = base_input();
        input.occurrences = vec![
            OccurrenceInput {
                start_date: "2026-05-01T19:00:00-04:00".to_owned(),
                end_date: Some("2026-05-01T21:00:00-04:00".to_owned()),
                ..Default::default()
            },
            OccurrenceInput {
                start_date: "2026-05-02T19:00:00-04:00".to_owned(),
                end_date: Some("2026-05-02T18:00:00-04:00".to_owned()),
                ..Default::default()
            },
        ];
        assert_eq!(
            field_of(validate(&input, &config).unwrap_err()),
            "occurrences[1].endDate"
        );
    }

    #[test]
    fn test_rejects_bad_timestamps_and_timezones() {
        let config = IngestConfig::default();

        let mut input = base_input();
        input.start_date = Some("May 1st, 7pm".to_owned());
        assert_eq!(field_of(validate(&input, &config).unwrap_err()), "startDate");

        let mut input = base_input();
        input.occurrences = vec![OccurrenceInput {
            start_date: "2026-05-01T19:00:00-04:00".to_owned(),
            timezone: Some("Mars/Olympus_Mons".to_owned()),
            ..Default::default()
        }];
        assert_eq!(
            field_of(validate(&input, &config).unwrap_err()),
            "occurrences[0].timezone"
        );

        input.occurrences[0].timezone = Some("Europe/Paris".to_owned());
        let validated = validate(&input, &config).unwrap();
        assert_eq!(validated.occurrences[0].timezone, "Europe/Paris");
    }

    #[test]
    fn test_base_url() {
        assert_eq!(
            base_url("https://www.example.com/events/123?ref=feed").unwrap(),
            "https://www.example.com"
        );
        assert_eq!(
            base_url("http://localhost:8080/feed").unwrap(),
            "http://localhost:8080"
        );
        assert!(base_url("ftp://example.com").is_err());
    }
}
