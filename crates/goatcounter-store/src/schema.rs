/// SQLite schema.
///
/// Executed once at open time via `Connection::execute_batch`. Every statement
/// uses `IF NOT EXISTS` / `OR IGNORE` so it is safe to run on each startup.
///
/// Times are stored as `YYYY-MM-DD HH:MM:SS` text in UTC; days as
/// `YYYY-MM-DD`. `hit_stats.stats` is a JSON array of 24 integers.
pub const SQLITE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS store (
    key             TEXT PRIMARY KEY,
    value           TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sites (
    site_id         INTEGER PRIMARY KEY AUTOINCREMENT,
    parent          INTEGER,
    code            TEXT NOT NULL UNIQUE,
    cname           TEXT UNIQUE,
    settings        TEXT NOT NULL DEFAULT '{}',
    first_hit_at    TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    deleted_at      TEXT
);

CREATE TABLE IF NOT EXISTS users (
    user_id         INTEGER PRIMARY KEY AUTOINCREMENT,
    site_id         INTEGER NOT NULL REFERENCES sites(site_id) ON DELETE CASCADE,
    email           TEXT NOT NULL,
    access          TEXT NOT NULL DEFAULT 'admin',
    created_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS users_site ON users(site_id);

CREATE TABLE IF NOT EXISTS api_tokens (
    api_token_id    INTEGER PRIMARY KEY AUTOINCREMENT,
    site_id         INTEGER NOT NULL REFERENCES sites(site_id) ON DELETE CASCADE,
    user_id         INTEGER NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
    name            TEXT NOT NULL,
    token           TEXT NOT NULL UNIQUE,
    permissions     INTEGER NOT NULL,
    created_at      TEXT NOT NULL,
    last_used_at    TEXT
);

CREATE TABLE IF NOT EXISTS paths (
    path_id         INTEGER PRIMARY KEY AUTOINCREMENT,
    site_id         INTEGER NOT NULL REFERENCES sites(site_id) ON DELETE CASCADE,
    path            TEXT NOT NULL,
    title           TEXT NOT NULL DEFAULT '',
    event           INTEGER NOT NULL DEFAULT 0
);
CREATE UNIQUE INDEX IF NOT EXISTS paths_site_path_event ON paths(site_id, path, event);

CREATE TABLE IF NOT EXISTS browsers (
    browser_id      INTEGER PRIMARY KEY AUTOINCREMENT,
    name            TEXT NOT NULL,
    version         TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS browsers_name_version ON browsers(name, version);

CREATE TABLE IF NOT EXISTS systems (
    system_id       INTEGER PRIMARY KEY AUTOINCREMENT,
    name            TEXT NOT NULL,
    version         TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS systems_name_version ON systems(name, version);

CREATE TABLE IF NOT EXISTS user_agents (
    user_agent_id   INTEGER PRIMARY KEY AUTOINCREMENT,
    browser_id      INTEGER NOT NULL REFERENCES browsers(browser_id),
    system_id       INTEGER NOT NULL REFERENCES systems(system_id),
    ua              TEXT NOT NULL UNIQUE,
    isbot           INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS refs (
    ref_id          INTEGER PRIMARY KEY AUTOINCREMENT,
    ref             TEXT NOT NULL,
    ref_scheme      TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS refs_ref_scheme ON refs(lower(ref), ref_scheme);
INSERT OR IGNORE INTO refs (ref_id, ref, ref_scheme) VALUES (1, '', 'o');

CREATE TABLE IF NOT EXISTS campaigns (
    campaign_id     INTEGER PRIMARY KEY AUTOINCREMENT,
    site_id         INTEGER NOT NULL REFERENCES sites(site_id) ON DELETE CASCADE,
    name            TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS campaigns_site_name ON campaigns(site_id, lower(name));

CREATE TABLE IF NOT EXISTS hits (
    hit_id          INTEGER PRIMARY KEY AUTOINCREMENT,
    site_id         INTEGER NOT NULL REFERENCES sites(site_id) ON DELETE CASCADE,
    path_id         INTEGER NOT NULL REFERENCES paths(path_id),
    ref_id          INTEGER NOT NULL DEFAULT 1 REFERENCES refs(ref_id),
    user_agent_id   INTEGER REFERENCES user_agents(user_agent_id),
    campaign_id     INTEGER REFERENCES campaigns(campaign_id),
    session         TEXT,
    bot             INTEGER NOT NULL DEFAULT 0,
    size            TEXT NOT NULL DEFAULT '',
    location        TEXT NOT NULL DEFAULT '',
    language        TEXT,
    first_visit     INTEGER NOT NULL DEFAULT 0,
    created_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS hits_site_created ON hits(site_id, created_at);

CREATE TABLE IF NOT EXISTS hit_counts (
    site_id         INTEGER NOT NULL REFERENCES sites(site_id) ON DELETE CASCADE,
    path_id         INTEGER NOT NULL,
    hour            TEXT NOT NULL,
    total           INTEGER NOT NULL,
    PRIMARY KEY (site_id, path_id, hour)
);

CREATE TABLE IF NOT EXISTS hit_stats (
    site_id         INTEGER NOT NULL REFERENCES sites(site_id) ON DELETE CASCADE,
    path_id         INTEGER NOT NULL,
    day             TEXT NOT NULL,
    stats           TEXT NOT NULL,
    PRIMARY KEY (site_id, path_id, day)
);

CREATE TABLE IF NOT EXISTS ref_counts (
    site_id         INTEGER NOT NULL REFERENCES sites(site_id) ON DELETE CASCADE,
    path_id         INTEGER NOT NULL,
    ref_id          INTEGER NOT NULL,
    hour            TEXT NOT NULL,
    total           INTEGER NOT NULL,
    PRIMARY KEY (site_id, path_id, ref_id, hour)
);

CREATE TABLE IF NOT EXISTS browser_stats (
    site_id         INTEGER NOT NULL REFERENCES sites(site_id) ON DELETE CASCADE,
    path_id         INTEGER NOT NULL,
    browser_id      INTEGER NOT NULL,
    day             TEXT NOT NULL,
    count           INTEGER NOT NULL,
    PRIMARY KEY (site_id, path_id, browser_id, day)
);

CREATE TABLE IF NOT EXISTS system_stats (
    site_id         INTEGER NOT NULL REFERENCES sites(site_id) ON DELETE CASCADE,
    path_id         INTEGER NOT NULL,
    system_id       INTEGER NOT NULL,
    day             TEXT NOT NULL,
    count           INTEGER NOT NULL,
    PRIMARY KEY (site_id, path_id, system_id, day)
);

CREATE TABLE IF NOT EXISTS location_stats (
    site_id         INTEGER NOT NULL REFERENCES sites(site_id) ON DELETE CASCADE,
    path_id         INTEGER NOT NULL,
    day             TEXT NOT NULL,
    location        TEXT NOT NULL,
    count           INTEGER NOT NULL,
    PRIMARY KEY (site_id, path_id, day, location)
);

CREATE TABLE IF NOT EXISTS language_stats (
    site_id         INTEGER NOT NULL REFERENCES sites(site_id) ON DELETE CASCADE,
    path_id         INTEGER NOT NULL,
    day             TEXT NOT NULL,
    language        TEXT NOT NULL,
    count           INTEGER NOT NULL,
    PRIMARY KEY (site_id, path_id, day, language)
);

CREATE TABLE IF NOT EXISTS size_stats (
    site_id         INTEGER NOT NULL REFERENCES sites(site_id) ON DELETE CASCADE,
    path_id         INTEGER NOT NULL,
    day             TEXT NOT NULL,
    width           INTEGER NOT NULL,
    count           INTEGER NOT NULL,
    PRIMARY KEY (site_id, path_id, day, width)
);

CREATE TABLE IF NOT EXISTS campaign_stats (
    site_id         INTEGER NOT NULL REFERENCES sites(site_id) ON DELETE CASCADE,
    campaign_id     INTEGER NOT NULL,
    day             TEXT NOT NULL,
    session         TEXT NOT NULL DEFAULT '',
    count           INTEGER NOT NULL,
    count_unique    INTEGER NOT NULL,
    PRIMARY KEY (site_id, campaign_id, day, session)
);
"#;

/// PostgreSQL schema. Same tables and columns as [`SQLITE_SCHEMA`], with
/// native types for times. Statements are run one at a time.
pub const POSTGRES_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS store (
        key             varchar PRIMARY KEY,
        value           text NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS sites (
        site_id         bigserial PRIMARY KEY,
        parent          bigint,
        code            varchar NOT NULL UNIQUE,
        cname           varchar UNIQUE,
        settings        text NOT NULL DEFAULT '{}',
        first_hit_at    timestamptz NOT NULL,
        created_at      timestamptz NOT NULL,
        deleted_at      timestamptz
    )",
    "CREATE TABLE IF NOT EXISTS users (
        user_id         bigserial PRIMARY KEY,
        site_id         bigint NOT NULL REFERENCES sites(site_id) ON DELETE CASCADE,
        email           varchar NOT NULL,
        access          varchar NOT NULL DEFAULT 'admin',
        created_at      timestamptz NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS users_site ON users(site_id)",
    "CREATE TABLE IF NOT EXISTS api_tokens (
        api_token_id    bigserial PRIMARY KEY,
        site_id         bigint NOT NULL REFERENCES sites(site_id) ON DELETE CASCADE,
        user_id         bigint NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
        name            varchar NOT NULL,
        token           varchar NOT NULL UNIQUE,
        permissions     bigint NOT NULL,
        created_at      timestamptz NOT NULL,
        last_used_at    timestamptz
    )",
    "CREATE TABLE IF NOT EXISTS paths (
        path_id         bigserial PRIMARY KEY,
        site_id         bigint NOT NULL REFERENCES sites(site_id) ON DELETE CASCADE,
        path            varchar NOT NULL,
        title           varchar NOT NULL DEFAULT '',
        event           integer NOT NULL DEFAULT 0
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS paths_site_path_event ON paths(site_id, path, event)",
    "CREATE TABLE IF NOT EXISTS browsers (
        browser_id      bigserial PRIMARY KEY,
        name            varchar NOT NULL,
        version         varchar NOT NULL
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS browsers_name_version ON browsers(name, version)",
    "CREATE TABLE IF NOT EXISTS systems (
        system_id       bigserial PRIMARY KEY,
        name            varchar NOT NULL,
        version         varchar NOT NULL
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS systems_name_version ON systems(name, version)",
    "CREATE TABLE IF NOT EXISTS user_agents (
        user_agent_id   bigserial PRIMARY KEY,
        browser_id      bigint NOT NULL REFERENCES browsers(browser_id),
        system_id       bigint NOT NULL REFERENCES systems(system_id),
        ua              varchar NOT NULL UNIQUE,
        isbot           integer NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS refs (
        ref_id          bigserial PRIMARY KEY,
        ref             varchar NOT NULL,
        ref_scheme      varchar NOT NULL
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS refs_ref_scheme ON refs(lower(ref), ref_scheme)",
    "INSERT INTO refs (ref_id, ref, ref_scheme) VALUES (1, '', 'o') ON CONFLICT DO NOTHING",
    "SELECT setval('refs_ref_id_seq', GREATEST((SELECT max(ref_id) FROM refs), 1))",
    "CREATE TABLE IF NOT EXISTS campaigns (
        campaign_id     bigserial PRIMARY KEY,
        site_id         bigint NOT NULL REFERENCES sites(site_id) ON DELETE CASCADE,
        name            varchar NOT NULL
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS campaigns_site_name ON campaigns(site_id, lower(name))",
    "CREATE TABLE IF NOT EXISTS hits (
        hit_id          bigserial PRIMARY KEY,
        site_id         bigint NOT NULL REFERENCES sites(site_id) ON DELETE CASCADE,
        path_id         bigint NOT NULL REFERENCES paths(path_id),
        ref_id          bigint NOT NULL DEFAULT 1 REFERENCES refs(ref_id),
        user_agent_id   bigint REFERENCES user_agents(user_agent_id),
        campaign_id     bigint REFERENCES campaigns(campaign_id),
        session         varchar,
        bot             integer NOT NULL DEFAULT 0,
        size            varchar NOT NULL DEFAULT '',
        location        varchar NOT NULL DEFAULT '',
        language        varchar,
        first_visit     integer NOT NULL DEFAULT 0,
        created_at      timestamptz NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS hits_site_created ON hits(site_id, created_at)",
    "CREATE TABLE IF NOT EXISTS hit_counts (
        site_id         bigint NOT NULL REFERENCES sites(site_id) ON DELETE CASCADE,
        path_id         bigint NOT NULL,
        hour            timestamptz NOT NULL,
        total           bigint NOT NULL,
        PRIMARY KEY (site_id, path_id, hour)
    )",
    "CREATE TABLE IF NOT EXISTS hit_stats (
        site_id         bigint NOT NULL REFERENCES sites(site_id) ON DELETE CASCADE,
        path_id         bigint NOT NULL,
        day             date NOT NULL,
        stats           text NOT NULL,
        PRIMARY KEY (site_id, path_id, day)
    )",
    "CREATE TABLE IF NOT EXISTS ref_counts (
        site_id         bigint NOT NULL REFERENCES sites(site_id) ON DELETE CASCADE,
        path_id         bigint NOT NULL,
        ref_id          bigint NOT NULL,
        hour            timestamptz NOT NULL,
        total           bigint NOT NULL,
        PRIMARY KEY (site_id, path_id, ref_id, hour)
    )",
    "CREATE TABLE IF NOT EXISTS browser_stats (
        site_id         bigint NOT NULL REFERENCES sites(site_id) ON DELETE CASCADE,
        path_id         bigint NOT NULL,
        browser_id      bigint NOT NULL,
        day             date NOT NULL,
        count           bigint NOT NULL,
        PRIMARY KEY (site_id, path_id, browser_id, day)
    )",
    "CREATE TABLE IF NOT EXISTS system_stats (
        site_id         bigint NOT NULL REFERENCES sites(site_id) ON DELETE CASCADE,
        path_id         bigint NOT NULL,
        system_id       bigint NOT NULL,
        day             date NOT NULL,
        count           bigint NOT NULL,
        PRIMARY KEY (site_id, path_id, system_id, day)
    )",
    "CREATE TABLE IF NOT EXISTS location_stats (
        site_id         bigint NOT NULL REFERENCES sites(site_id) ON DELETE CASCADE,
        path_id         bigint NOT NULL,
        day             date NOT NULL,
        location        varchar NOT NULL,
        count           bigint NOT NULL,
        PRIMARY KEY (site_id, path_id, day, location)
    )",
    "CREATE TABLE IF NOT EXISTS language_stats (
        site_id         bigint NOT NULL REFERENCES sites(site_id) ON DELETE CASCADE,
        path_id         bigint NOT NULL,
        day             date NOT NULL,
        language        varchar NOT NULL,
        count           bigint NOT NULL,
        PRIMARY KEY (site_id, path_id, day, language)
    )",
    "CREATE TABLE IF NOT EXISTS size_stats (
        site_id         bigint NOT NULL REFERENCES sites(site_id) ON DELETE CASCADE,
        path_id         bigint NOT NULL,
        day             date NOT NULL,
        width           integer NOT NULL,
        count           bigint NOT NULL,
        PRIMARY KEY (site_id, path_id, day, width)
    )",
    "CREATE TABLE IF NOT EXISTS campaign_stats (
        site_id         bigint NOT NULL REFERENCES sites(site_id) ON DELETE CASCADE,
        campaign_id     bigint NOT NULL,
        day             date NOT NULL,
        session         varchar NOT NULL DEFAULT '',
        count           bigint NOT NULL,
        count_unique    bigint NOT NULL,
        PRIMARY KEY (site_id, campaign_id, day, session)
    )",
];

/// Tables holding per-site rows, children first.
pub const SITE_TABLES: &[&str] = &[
    "hit_counts",
    "hit_stats",
    "ref_counts",
    "browser_stats",
    "system_stats",
    "location_stats",
    "language_stats",
    "size_stats",
    "campaign_stats",
    "hits",
    "campaigns",
    "paths",
    "api_tokens",
    "users",
];
