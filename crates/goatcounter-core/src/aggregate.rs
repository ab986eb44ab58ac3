//! Fold persisted hits into additive counter rows.
//!
//! Every row produced here is a delta: the store adds it to whatever is
//! already there. Feeding the same hits in twice counts them twice.

use std::collections::BTreeMap;

use chrono::{DateTime, DurationRound, NaiveDate, TimeDelta, Timelike, Utc};

use crate::hit::Hit;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregateRow {
    HitCounts {
        path_id: i64,
        hour: DateTime<Utc>,
        total: i64,
    },
    HitStats {
        path_id: i64,
        day: NaiveDate,
        stats: [i64; 24],
    },
    RefCounts {
        path_id: i64,
        ref_id: i64,
        hour: DateTime<Utc>,
        total: i64,
    },
    BrowserStats {
        path_id: i64,
        browser_id: i64,
        day: NaiveDate,
        count: i64,
    },
    SystemStats {
        path_id: i64,
        system_id: i64,
        day: NaiveDate,
        count: i64,
    },
    LocationStats {
        path_id: i64,
        day: NaiveDate,
        location: String,
        count: i64,
    },
    LanguageStats {
        path_id: i64,
        day: NaiveDate,
        language: String,
        count: i64,
    },
    SizeStats {
        path_id: i64,
        day: NaiveDate,
        width: i32,
        count: i64,
    },
    /// Per campaign and session; `session` is the hex ID, empty without one.
    CampaignStats {
        campaign_id: i64,
        day: NaiveDate,
        session: String,
        count: i64,
        count_unique: i64,
    },
}

impl AggregateRow {
    pub fn table(&self) -> &'static str {
        match self {
            AggregateRow::HitCounts { .. } => "hit_counts",
            AggregateRow::HitStats { .. } => "hit_stats",
            AggregateRow::RefCounts { .. } => "ref_counts",
            AggregateRow::BrowserStats { .. } => "browser_stats",
            AggregateRow::SystemStats { .. } => "system_stats",
            AggregateRow::LocationStats { .. } => "location_stats",
            AggregateRow::LanguageStats { .. } => "language_stats",
            AggregateRow::SizeStats { .. } => "size_stats",
            AggregateRow::CampaignStats { .. } => "campaign_stats",
        }
    }
}

#[derive(Default)]
struct Buckets {
    hit_counts: BTreeMap<(i64, DateTime<Utc>), i64>,
    hit_stats: BTreeMap<(i64, NaiveDate), [i64; 24]>,
    ref_counts: BTreeMap<(i64, i64, DateTime<Utc>), i64>,
    browsers: BTreeMap<(i64, i64, NaiveDate), i64>,
    systems: BTreeMap<(i64, i64, NaiveDate), i64>,
    locations: BTreeMap<(i64, NaiveDate, String), i64>,
    languages: BTreeMap<(i64, NaiveDate, String), i64>,
    sizes: BTreeMap<(i64, NaiveDate, i32), i64>,
    campaigns: BTreeMap<(i64, NaiveDate, String), (i64, i64)>,
}

impl Buckets {
    fn add(&mut self, hit: &Hit) {
        let hour = truncate_hour(hit.created_at);
        let day = hit.created_at.date_naive();
        let path = hit.path_id;

        *self.hit_counts.entry((path, hour)).or_default() += 1;
        *self.ref_counts.entry((path, hit.ref_id, hour)).or_default() += 1;
        if let Some(campaign) = hit.campaign_id {
            let session = hit.session.map(|s| s.to_string()).unwrap_or_default();
            let (count, unique) = self.campaigns.entry((campaign, day, session)).or_default();
            *count += 1;
            *unique += i64::from(hit.first_visit);
        }

        if !hit.first_visit {
            return;
        }
        self.hit_stats.entry((path, day)).or_insert([0; 24])[hit.created_at.hour() as usize] += 1;
        if let Some(b) = hit.browser_id {
            *self.browsers.entry((path, b, day)).or_default() += 1;
        }
        if let Some(s) = hit.system_id {
            *self.systems.entry((path, s, day)).or_default() += 1;
        }
        if !hit.location.is_empty() {
            *self.locations.entry((path, day, hit.location.clone())).or_default() += 1;
        }
        if let Some(lang) = hit.language.as_ref().filter(|l| !l.is_empty()) {
            *self.languages.entry((path, day, lang.clone())).or_default() += 1;
        }
        if let Some(size) = hit.size {
            *self.sizes.entry((path, day, size.bucket())).or_default() += 1;
        }
    }

    fn into_rows(self) -> Vec<AggregateRow> {
        let mut rows = Vec::new();
        rows.extend(self.hit_counts.into_iter().map(|((path_id, hour), total)| {
            AggregateRow::HitCounts { path_id, hour, total }
        }));
        rows.extend(
            self.hit_stats
                .into_iter()
                .filter(|(_, stats)| stats.iter().any(|&n| n != 0))
                .map(|((path_id, day), stats)| AggregateRow::HitStats { path_id, day, stats }),
        );
        rows.extend(self.ref_counts.into_iter().map(|((path_id, ref_id, hour), total)| {
            AggregateRow::RefCounts { path_id, ref_id, hour, total }
        }));
        rows.extend(self.browsers.into_iter().map(|((path_id, browser_id, day), count)| {
            AggregateRow::BrowserStats { path_id, browser_id, day, count }
        }));
        rows.extend(self.systems.into_iter().map(|((path_id, system_id, day), count)| {
            AggregateRow::SystemStats { path_id, system_id, day, count }
        }));
        rows.extend(self.locations.into_iter().map(|((path_id, day, location), count)| {
            AggregateRow::LocationStats { path_id, day, location, count }
        }));
        rows.extend(self.languages.into_iter().map(|((path_id, day, language), count)| {
            AggregateRow::LanguageStats { path_id, day, language, count }
        }));
        rows.extend(self.sizes.into_iter().map(|((path_id, day, width), count)| {
            AggregateRow::SizeStats { path_id, day, width, count }
        }));
        rows.extend(self.campaigns.into_iter().map(
            |((campaign_id, day, session), (count, count_unique))| AggregateRow::CampaignStats {
                campaign_id,
                day,
                session,
                count,
                count_unique,
            },
        ));
        rows
    }
}

pub fn truncate_hour(t: DateTime<Utc>) -> DateTime<Utc> {
    t.duration_trunc(TimeDelta::hours(1)).unwrap_or(t)
}

/// Group non-bot hits by site and fold them into counter deltas.
pub fn aggregate(hits: &[Hit]) -> BTreeMap<i64, Vec<AggregateRow>> {
    let mut by_site: BTreeMap<i64, Buckets> = BTreeMap::new();
    for hit in hits.iter().filter(|h| h.bot == 0) {
        by_site.entry(hit.site_id).or_default().add(hit);
    }
    by_site
        .into_iter()
        .map(|(site, buckets)| (site, buckets.into_rows()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hit::Size;
    use chrono::TimeZone;

    fn hit(path_id: i64, at: DateTime<Utc>, first: bool) -> Hit {
        Hit {
            site_id: 1,
            path_id,
            ref_id: 1,
            first_visit: first,
            created_at: at,
            ..Default::default()
        }
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 6, 18, h, m, 0).unwrap()
    }

    #[test]
    fn counts_every_hit_and_first_visits_once() {
        let hits = vec![hit(5, at(14, 42), true), hit(5, at(14, 50), false)];
        let rows = &aggregate(&hits)[&1];

        assert!(rows.contains(&AggregateRow::HitCounts {
            path_id: 5,
            hour: at(14, 0),
            total: 2
        }));
        let mut stats = [0; 24];
        stats[14] = 1;
        assert!(rows.contains(&AggregateRow::HitStats {
            path_id: 5,
            day: at(0, 0).date_naive(),
            stats
        }));
        assert!(rows.contains(&AggregateRow::RefCounts {
            path_id: 5,
            ref_id: 1,
            hour: at(14, 0),
            total: 2
        }));
    }

    #[test]
    fn hour_boundary_belongs_to_that_hour() {
        let rows = &aggregate(&[hit(5, at(15, 0), false)])[&1];
        assert_eq!(
            rows[0],
            AggregateRow::HitCounts {
                path_id: 5,
                hour: at(15, 0),
                total: 1
            }
        );
    }

    #[test]
    fn bots_are_skipped() {
        let mut h = hit(5, at(1, 0), true);
        h.bot = 155;
        assert!(aggregate(&[h]).is_empty());
    }

    #[test]
    fn no_stats_row_without_first_visit() {
        let rows = &aggregate(&[hit(5, at(1, 0), false)])[&1];
        assert!(rows.iter().all(|r| r.table() != "hit_stats"));
    }

    #[test]
    fn dimensions_only_on_first_visit() {
        let mut first = hit(5, at(9, 0), true);
        first.browser_id = Some(3);
        first.system_id = Some(4);
        first.location = "NL".into();
        first.language = Some("nld".into());
        first.size = Some(Size {
            width: 1920.0,
            height: 1080.0,
            scale: 1.0,
        });
        let mut again = first.clone();
        again.first_visit = false;

        let rows = &aggregate(&[first, again])[&1];
        let day = at(0, 0).date_naive();
        for want in [
            AggregateRow::BrowserStats { path_id: 5, browser_id: 3, day, count: 1 },
            AggregateRow::SystemStats { path_id: 5, system_id: 4, day, count: 1 },
            AggregateRow::LocationStats { path_id: 5, day, location: "NL".into(), count: 1 },
            AggregateRow::LanguageStats { path_id: 5, day, language: "nld".into(), count: 1 },
            AggregateRow::SizeStats { path_id: 5, day, width: 1920, count: 1 },
        ] {
            assert!(rows.contains(&want), "missing {want:?}");
        }
    }

    #[test]
    fn campaign_counts_per_session() {
        let mut first = hit(5, at(9, 0), true);
        first.campaign_id = Some(7);
        let mut again = hit(6, at(10, 0), false);
        again.campaign_id = Some(7);

        let rows = &aggregate(&[first, again, hit(5, at(11, 0), true)])[&1];
        let campaigns: Vec<_> = rows.iter().filter(|r| r.table() == "campaign_stats").collect();
        assert_eq!(
            campaigns,
            vec![&AggregateRow::CampaignStats {
                campaign_id: 7,
                day: at(0, 0).date_naive(),
                session: String::new(),
                count: 2,
                count_unique: 1,
            }]
        );
    }

    #[test]
    fn grouped_per_site() {
        let mut other = hit(9, at(2, 0), true);
        other.site_id = 2;
        let out = aggregate(&[hit(5, at(2, 0), true), other]);
        assert_eq!(out.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
    }
}
