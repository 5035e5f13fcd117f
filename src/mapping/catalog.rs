//! Built-in mappings from the `ImageInfo` vocabulary to the storage tables.
//!
//! Order matters: `assets` comes first so child rows never reference a missing parent.

use crate::database::executor::ConflictPolicy;
use super::transforms::{self, ExplodeSpec};
use super::{MappingRule, TableMapping};

pub fn default_mappings() -> Vec<TableMapping> {
    vec![
        assets_mapping(),
        captions_mapping(),
        tags_mapping(),
        poses_mapping(),
    ]
}

pub fn assets_mapping() -> TableMapping {
    TableMapping {
        table: "assets".into(),
        rules: vec![
            MappingRule::rename("asset_id", "id"),
            MappingRule::custom("dataset_id", &["dataset_id"], transforms::attach_dataset_id),
            MappingRule::rename("asset_path", "file_path"),
            MappingRule::custom("asset_path", &["file_format"], transforms::file_format),
            MappingRule::rename_optional("W", "width"),
            MappingRule::rename_optional("H", "height"),
            MappingRule::rename_optional("Q512", "quality_score"),
            MappingRule::rename_optional("A", "aesthetic_score"),
            MappingRule::rename_optional("A_CENTER", "semantic_center"),
            MappingRule::rename_optional("A_EAT", "aesthetic_eat"),
            MappingRule::rename_optional("HAS_WATERMARK", "watermark_prob"),
            MappingRule::rename_optional("IMG_EMBD", "embedding"),
        ],
        primary_key: vec!["id".into()],
        policy: ConflictPolicy::NullOnly,
    }
}

pub fn captions_mapping() -> TableMapping {
    TableMapping {
        table: "asset_captions".into(),
        rules: vec![
            MappingRule::explode(
                "CAP",
                ExplodeSpec::scalar("caption")
                    .labeled("caption_type", "generic")
                    .trimmed(),
            ),
            MappingRule::explode(
                "HQ_CAP",
                ExplodeSpec::scalar("caption")
                    .labeled("caption_type", "hq")
                    .trimmed(),
            ),
        ],
        primary_key: vec!["asset_id".into(), "caption_type".into(), "caption".into()],
        policy: ConflictPolicy::Overwrite,
    }
}

pub fn tags_mapping() -> TableMapping {
    TableMapping {
        table: "asset_tags".into(),
        rules: vec![MappingRule::custom("DBRU_TAG", &["tags"], transforms::split_tags)],
        primary_key: vec!["asset_id".into()],
        policy: ConflictPolicy::Overwrite,
    }
}

pub fn poses_mapping() -> TableMapping {
    TableMapping {
        table: "asset_poses".into(),
        rules: vec![MappingRule::explode(
            "POSE_KPTS",
            ExplodeSpec::objects(
                "pose_index",
                &[
                    ("BBOX", "bbox"),
                    ("INVLD_KPTS_IDX", "invalid_kpts_idx"),
                    ("KPTS_X", "kpts_x"),
                    ("KPTS_Y", "kpts_y"),
                ],
            ),
        )],
        primary_key: vec!["asset_id".into(), "pose_index".into()],
        policy: ConflictPolicy::Overwrite,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::table::RecordTable;
    use crate::mapping::MappingContext;
    use serde_json::{json, Value};
    use std::path::Path;
    use uuid::Uuid;

    fn resolved(records: Vec<Value>) -> RecordTable {
        // Shape the identity resolver leaves behind.
        let mut with_ids = Vec::new();
        for (i, mut r) in records.into_iter().enumerate() {
            let path = r["IMG"].clone();
            r["asset_id"] = json!(format!("id-{}", i));
            r["asset_path"] = path;
            r["_record"] = json!(i);
            with_ids.push(r);
        }
        RecordTable::from_records(with_ids, Path::new("ImageInfo.json")).unwrap()
    }

    fn context() -> MappingContext {
        MappingContext {
            dataset_id: Uuid::nil(),
        }
    }

    #[test]
    fn test_caption_example() {
        let t = resolved(vec![json!({
            "IMG": "a/b.png", "W": 100, "H": 50, "CAP": ["x", "y"], "HQ_CAP": ["z"]
        })]);
        let rows = captions_mapping().apply(t, &context()).unwrap();

        assert_eq!(rows.columns, vec!["caption_type", "caption", "asset_id"]);
        assert_eq!(
            rows.rows,
            vec![
                vec![json!("generic"), json!("x"), json!("id-0")],
                vec![json!("generic"), json!("y"), json!("id-0")],
                vec![json!("hq"), json!("z"), json!("id-0")],
            ]
        );
    }

    #[test]
    fn test_hq_captions_survive_without_generic_ones() {
        let t = resolved(vec![json!({"IMG": "a.png", "HQ_CAP": ["only"]})]);
        let rows = captions_mapping().apply(t, &context()).unwrap();
        assert_eq!(rows.rows.len(), 1);
        assert_eq!(rows.rows[0][0], json!("hq"));
    }

    #[test]
    fn test_duplicate_captions_collapse() {
        let t = resolved(vec![json!({"IMG": "a.png", "CAP": ["x", "x "]})]);
        let rows = captions_mapping().apply(t, &context()).unwrap();
        assert_eq!(rows.rows.len(), 1);
    }

    #[test]
    fn test_array_fan_out_references_parent() {
        let t = resolved(vec![json!({
            "IMG": "a.png",
            "CAP": ["one", "two", "three"],
            "POSE_KPTS": [
                {"BBOX": [0, 0, 5, 5], "INVLD_KPTS_IDX": [1], "KPTS_X": [0.5], "KPTS_Y": [0.25]},
                {"BBOX": [1, 1, 4, 4], "INVLD_KPTS_IDX": [], "KPTS_X": [0.1], "KPTS_Y": [0.2]}
            ]
        })]);
        let captions = captions_mapping().apply(t.clone(), &context()).unwrap();
        let poses = poses_mapping().apply(t, &context()).unwrap();

        assert_eq!(captions.rows.len(), 3);
        assert_eq!(poses.rows.len(), 2);
        let asset = poses.columns.iter().position(|c| c == "asset_id").unwrap();
        let index = poses.columns.iter().position(|c| c == "pose_index").unwrap();
        assert!(poses.rows.iter().all(|r| r[asset] == json!("id-0")));
        assert_eq!(poses.rows[1][index], json!(1));
    }

    #[test]
    fn test_assets_mapping_columns() {
        let t = resolved(vec![json!({"IMG": "sub/a.JPG", "W": 640, "IMG_EMBD": [0.1, 0.2]})]);
        let rows = assets_mapping().apply(t, &context()).unwrap();
        let row = &rows.rows[0];
        let col = |name: &str| rows.columns.iter().position(|c| c == name).unwrap();

        assert_eq!(rows.columns[0], "id");
        assert_eq!(row[col("dataset_id")], json!(Uuid::nil().to_string()));
        assert_eq!(row[col("file_format")], json!("jpg"));
        assert_eq!(row[col("width")], json!(640));
        assert_eq!(row[col("height")], Value::Null);
        assert_eq!(row[col("embedding")], json!([0.1, 0.2]));
    }

    #[test]
    fn test_records_without_tags_or_poses_produce_no_rows() {
        let t = resolved(vec![json!({"IMG": "a.png"})]);
        assert!(tags_mapping().apply(t.clone(), &context()).unwrap().rows.is_empty());
        assert!(poses_mapping().apply(t.clone(), &context()).unwrap().rows.is_empty());
        assert!(captions_mapping().apply(t, &context()).unwrap().rows.is_empty());
    }
}
