use chrono::{Duration, NaiveDate, TimeZone, Utc};
use goatcounter_core::aggregate::{aggregate, AggregateRow};
use goatcounter_core::clean::{RefScheme, EMPTY_REF_ID};
use goatcounter_core::hit::Hit;
use goatcounter_core::site::{Access, Permissions, SiteSettings};
use goatcounter_core::store::Store;
use goatcounter_store::SqliteStore;

async fn setup() -> (SqliteStore, i64) {
    let db = SqliteStore::open_in_memory().expect("open in-memory db");
    let site = db
        .create_site("example", Some("example.com"), &SiteSettings::default())
        .await
        .expect("create site");
    (db, site.id)
}

fn resolved_hit(site_id: i64, path_id: i64, at: chrono::DateTime<Utc>) -> Hit {
    Hit {
        path_id,
        ref_id: EMPTY_REF_ID,
        first_visit: true,
        ..Hit::new(site_id, "/", at)
    }
}

// ===== BDD: sites can be looked up by code and cname =====

#[tokio::test]
async fn site_lookup_by_code_and_cname() {
    let (db, id) = setup().await;
    let by_code = db.site_by_code("example").await.unwrap().expect("by code");
    assert_eq!(by_code.id, id);
    let by_cname = db.site_by_cname("example.com").await.unwrap().expect("by cname");
    assert_eq!(by_cname.id, id);
    assert!(db.site_by_code("nope").await.unwrap().is_none());
}

#[tokio::test]
async fn duplicate_site_code_is_a_conflict() {
    let (db, _) = setup().await;
    let err = db
        .create_site("example", None, &SiteSettings::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("already exists"), "{err}");
}

#[tokio::test]
async fn deleted_sites_are_hidden_then_purged() {
    let (db, id) = setup().await;
    let path_id = db.path_get_or_insert(id, "/x", "", false).await.unwrap();
    let now = Utc::now();
    db.insert_hits(id, &[resolved_hit(id, path_id, now)]).await.unwrap();

    db.delete_site(id, now - Duration::days(10)).await.unwrap();
    assert!(db.site_by_id(id).await.unwrap().is_none());

    let purged = db.purge_deleted_sites(now - Duration::days(7)).await.unwrap();
    assert_eq!(purged, 1);

    let conn = db.conn_for_test().await;
    let n: i64 = conn
        .query_row("SELECT count(*) FROM hits", [], |r| r.get(0))
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn first_hit_is_only_pulled_back() {
    let (db, id) = setup().await;
    let created = db.site_by_id(id).await.unwrap().unwrap().first_hit_at;

    let earlier = created - Duration::days(3);
    db.pull_back_first_hit(id, earlier).await.unwrap();
    let later = created + Duration::days(3);
    db.pull_back_first_hit(id, later).await.unwrap();

    let site = db.site_by_id(id).await.unwrap().unwrap();
    assert_eq!(site.first_hit_at.timestamp(), earlier.timestamp());
}

// ===== BDD: surrogate IDs are stable =====

#[tokio::test]
async fn get_or_insert_returns_existing_ids() {
    let (db, id) = setup().await;

    let p1 = db.path_get_or_insert(id, "/a", "A", false).await.unwrap();
    let p2 = db.path_get_or_insert(id, "/a", "A again", false).await.unwrap();
    let ev = db.path_get_or_insert(id, "/a", "", true).await.unwrap();
    assert_eq!(p1, p2);
    assert_ne!(p1, ev);

    let b1 = db.browser_get_or_insert("Firefox", "79").await.unwrap();
    let b2 = db.browser_get_or_insert("Firefox", "79").await.unwrap();
    assert_eq!(b1, b2);

    let s = db.system_get_or_insert("Linux", "").await.unwrap();
    let ua1 = db.user_agent_get_or_insert("~Z (X11; Linux x86_64)", b1, s, 0).await.unwrap();
    let ua2 = db.user_agent_get_or_insert("~Z (X11; Linux x86_64)", b1, s, 0).await.unwrap();
    assert_eq!(ua1, ua2);

    let c1 = db.campaign_get_or_insert(id, "Launch").await.unwrap();
    let c2 = db.campaign_get_or_insert(id, "launch").await.unwrap();
    assert_eq!(c1, c2);
}

#[tokio::test]
async fn refs_match_case_insensitively_per_scheme() {
    let (db, _) = setup().await;
    assert_eq!(db.ref_get_or_insert("", RefScheme::Other).await.unwrap(), EMPTY_REF_ID);

    let r1 = db.ref_get_or_insert("example.org/page", RefScheme::Http).await.unwrap();
    let r2 = db.ref_get_or_insert("Example.org/page", RefScheme::Http).await.unwrap();
    let r3 = db.ref_get_or_insert("example.org/page", RefScheme::Other).await.unwrap();
    assert_eq!(r1, r2);
    assert_ne!(r1, r3);
    assert_ne!(r1, EMPTY_REF_ID);
}

// ===== BDD: aggregates accumulate across persist cycles =====

#[tokio::test]
async fn aggregates_add_up_across_batches() {
    let (db, id) = setup().await;
    let path_id = db.path_get_or_insert(id, "/", "", false).await.unwrap();
    let at = Utc.with_ymd_and_hms(2020, 6, 18, 14, 42, 0).unwrap();

    for _ in 0..2 {
        let hits = vec![resolved_hit(id, path_id, at)];
        db.insert_hits(id, &hits).await.unwrap();
        for (site, rows) in aggregate(&hits) {
            db.apply_aggregates(site, &rows).await.unwrap();
        }
    }

    let conn = db.conn_for_test().await;
    let total: i64 = conn
        .query_row(
            "SELECT total FROM hit_counts WHERE site_id = ?1 AND path_id = ?2",
            [id, path_id],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(total, 2);

    let stats: String = conn
        .query_row(
            "SELECT stats FROM hit_stats WHERE site_id = ?1 AND day = '2020-06-18'",
            [id],
            |r| r.get(0),
        )
        .unwrap();
    let stats: Vec<i64> = serde_json::from_str(&stats).unwrap();
    assert_eq!(stats[14], 2);
    assert_eq!(stats.iter().sum::<i64>(), 2);
}

#[tokio::test]
async fn size_stats_upsert() {
    let (db, id) = setup().await;
    let day = NaiveDate::from_ymd_opt(2020, 6, 18).unwrap();
    let row = AggregateRow::SizeStats {
        path_id: 1,
        day,
        width: 1920,
        count: 3,
    };
    db.apply_aggregates(id, &[row.clone()]).await.unwrap();
    db.apply_aggregates(id, &[row]).await.unwrap();

    let conn = db.conn_for_test().await;
    let count: i64 = conn
        .query_row("SELECT count FROM size_stats WHERE width = 1920", [], |r| r.get(0))
        .unwrap();
    assert_eq!(count, 6);
}

#[tokio::test]
async fn campaign_stats_add_up_per_session() {
    let (db, id) = setup().await;
    let path_id = db.path_get_or_insert(id, "/", "", false).await.unwrap();
    let campaign = db.campaign_get_or_insert(id, "launch").await.unwrap();
    let at = Utc.with_ymd_and_hms(2020, 6, 18, 14, 42, 0).unwrap();

    for first_visit in [true, false] {
        let hits = vec![Hit {
            campaign_id: Some(campaign),
            first_visit,
            ..resolved_hit(id, path_id, at)
        }];
        for (site, rows) in aggregate(&hits) {
            db.apply_aggregates(site, &rows).await.unwrap();
        }
    }

    let conn = db.conn_for_test().await;
    let (count, unique): (i64, i64) = conn
        .query_row(
            "SELECT count, count_unique FROM campaign_stats
             WHERE site_id = ?1 AND campaign_id = ?2 AND day = '2020-06-18' AND session = ''",
            [id, campaign],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .unwrap();
    assert_eq!((count, unique), (2, 1));
}

// ===== BDD: vacuum removes old raw hits =====

#[tokio::test]
async fn delete_hits_before_cutoff() {
    let (db, id) = setup().await;
    let path_id = db.path_get_or_insert(id, "/", "", false).await.unwrap();
    let now = Utc::now();
    db.insert_hits(
        id,
        &[
            resolved_hit(id, path_id, now - Duration::days(40)),
            resolved_hit(id, path_id, now),
        ],
    )
    .await
    .unwrap();

    let n = db.delete_hits_before(id, now - Duration::days(30)).await.unwrap();
    assert_eq!(n, 1);
}

// ===== BDD: users, tokens and key/value settings =====

#[tokio::test]
async fn tokens_are_found_by_hash() {
    let (db, id) = setup().await;
    let user = db.create_user(id, "me@example.com", Access::Admin).await.unwrap();
    assert_eq!(db.first_user(id).await.unwrap().unwrap().id, user.id);

    let tok = db
        .create_api_token(id, user.id, "count", "abc123", Permissions::COUNT)
        .await
        .unwrap();
    let found = db.api_token_by_hash("abc123").await.unwrap().expect("token");
    assert_eq!(found.id, tok.id);
    assert!(found.permissions.has(Permissions::COUNT));
    assert!(found.last_used_at.is_none());

    db.touch_api_token(tok.id, Utc::now()).await.unwrap();
    let found = db.api_token_by_hash("abc123").await.unwrap().unwrap();
    assert!(found.last_used_at.is_some());
}

#[tokio::test]
async fn key_value_overwrites() {
    let (db, _) = setup().await;
    assert!(db.get_value("buffer-secret").await.unwrap().is_none());
    db.set_value("buffer-secret", "one").await.unwrap();
    db.set_value("buffer-secret", "two").await.unwrap();
    assert_eq!(db.get_value("buffer-secret").await.unwrap().as_deref(), Some("two"));
}
