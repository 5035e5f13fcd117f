pub const SCHEMA: &str = "
    PRAGMA foreign_keys = ON;

    CREATE TABLE IF NOT EXISTS datasets (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        dir_path TEXT UNIQUE NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS assets (
        id TEXT PRIMARY KEY,
        dataset_id TEXT NOT NULL,
        file_path TEXT NOT NULL,
        file_format TEXT,
        file_hash TEXT,
        width INTEGER,
        height INTEGER,
        quality_score REAL,
        aesthetic_score REAL,
        semantic_center TEXT,
        aesthetic_eat REAL,
        watermark_prob REAL,
        embedding TEXT,
        FOREIGN KEY(dataset_id) REFERENCES datasets(id),
        UNIQUE(dataset_id, file_path)
    );

    CREATE INDEX IF NOT EXISTS idx_assets_dataset_id ON assets(dataset_id);

    CREATE TABLE IF NOT EXISTS asset_captions (
        asset_id TEXT NOT NULL,
        caption_type TEXT NOT NULL DEFAULT 'generic',
        caption TEXT NOT NULL,
        FOREIGN KEY(asset_id) REFERENCES assets(id),
        PRIMARY KEY(asset_id, caption_type, caption)
    );

    CREATE TABLE IF NOT EXISTS asset_tags (
        asset_id TEXT PRIMARY KEY,
        tags TEXT NOT NULL,
        FOREIGN KEY(asset_id) REFERENCES assets(id)
    );

    CREATE TABLE IF NOT EXISTS asset_poses (
        asset_id TEXT NOT NULL,
        pose_index INTEGER NOT NULL,
        bbox TEXT,
        invalid_kpts_idx TEXT,
        kpts_x TEXT,
        kpts_y TEXT,
        FOREIGN KEY(asset_id) REFERENCES assets(id),
        PRIMARY KEY(asset_id, pose_index)
    );
";
