//! Per-region volume statistics
//!
//! Counts voxels per target-space label, derives physical volumes, and
//! synthesizes merged anatomical aggregates (hemispheric gray matter and
//! vermis) whose ids sit beyond the native label range. Zero-voxel rows are
//! dropped, rows are sorted by id and re-indexed from 1, and the table is
//! rendered into a FreeSurfer-style stats file with provenance headers.

use cereb_seg_common::{Result, SegError};
use cereb_seg_core::LabelMap;
use ndarray::Array3;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::Path;

/// One reported region
#[derive(Debug, Clone, PartialEq)]
pub struct StatsRow {
    /// 1-based row index after sorting
    pub index: usize,
    /// Region id in the target label space
    pub seg_id: i64,
    pub n_voxels: usize,
    pub volume_mm3: f64,
    pub struct_name: String,
    /// Mean intensity over the region (0 without an intensity volume)
    pub intensity_mean: f64,
}

/// Immutable statistics table for one subject
#[derive(Debug, Clone, PartialEq)]
pub struct StatsTable {
    pub rows: Vec<StatsRow>,
    pub voxel_volume: f64,
}

/// A synthesized aggregate of several target-space regions
#[derive(Debug, Clone)]
pub struct MergedLabel {
    pub id: i64,
    pub name: String,
    pub members: Vec<i64>,
}

/// Name-prefix rule selecting the members of one merged aggregate
#[derive(Debug, Clone)]
pub struct MergeRule {
    pub name: String,
    pub prefix: String,
    /// Substring excluding a label from the aggregate (e.g. white matter)
    pub exclude: Option<String>,
}

/// The three standard cerebellar aggregates
#[must_use]
pub fn default_merge_rules() -> Vec<MergeRule> {
    vec![
        MergeRule {
            name: "Left Cerebellar Gray Matter".to_string(),
            prefix: "Left".to_string(),
            exclude: Some("Corpus_Medullare".to_string()),
        },
        MergeRule {
            name: "Right Cerebellar Gray Matter".to_string(),
            prefix: "Right".to_string(),
            exclude: Some("Corpus_Medullare".to_string()),
        },
        MergeRule {
            name: "Vermis".to_string(),
            prefix: "Vermis".to_string(),
            exclude: None,
        },
    ]
}

/// Resolve merge rules against the actual label table contents.
///
/// Aggregate ids are allocated directly past the largest mapped target id.
#[must_use]
pub fn merged_label_specs(
    target_names: &LabelMap<String, i64>,
    rules: &[MergeRule],
) -> Vec<MergedLabel> {
    let next_free = target_names.values().copied().max().unwrap_or(0) + 1;
    rules
        .iter()
        .enumerate()
        .map(|(rule_idx, rule)| {
            let members = target_names
                .iter()
                .filter(|(name, _)| {
                    name.starts_with(&rule.prefix)
                        && rule
                            .exclude
                            .as_ref()
                            .map_or(true, |excluded| !name.contains(excluded.as_str()))
                })
                .map(|(_, &id)| id)
                .collect();
            MergedLabel {
                id: next_free + rule_idx as i64,
                name: rule.name.clone(),
                members,
            }
        })
        .collect()
}

/// Compute the statistics table for a segmentation in target space.
///
/// Ids claimed by a merged aggregate are reported only through the
/// aggregate, not under their own id.
#[must_use]
pub fn compute_region_stats(
    seg: &Array3<i64>,
    intensity: Option<&Array3<f32>>,
    label_ids: &[i64],
    voxel_volume: f64,
    merged: &[MergedLabel],
    names: &LabelMap<i64, String>,
) -> StatsTable {
    let mut accumulators: HashMap<i64, (usize, f64)> = HashMap::with_capacity(label_ids.len());
    match intensity {
        Some(norm) => {
            for (&label, &value) in seg.iter().zip(norm.iter()) {
                let entry = accumulators.entry(label).or_insert((0, 0.0));
                entry.0 += 1;
                entry.1 += f64::from(value);
            }
        }
        None => {
            for &label in seg.iter() {
                accumulators.entry(label).or_insert((0, 0.0)).0 += 1;
            }
        }
    }

    let merged_member_ids: Vec<i64> = merged
        .iter()
        .flat_map(|aggregate| aggregate.members.iter().copied())
        .collect();

    let mut rows = Vec::with_capacity(label_ids.len() + merged.len());
    for &id in label_ids {
        if merged_member_ids.contains(&id) {
            continue;
        }
        let (count, sum) = accumulators.get(&id).copied().unwrap_or((0, 0.0));
        if count == 0 {
            continue;
        }
        rows.push(StatsRow {
            index: 0,
            seg_id: id,
            n_voxels: count,
            volume_mm3: count as f64 * voxel_volume,
            struct_name: names
                .get(&id)
                .cloned()
                .unwrap_or_else(|| format!("merged label {id}")),
            intensity_mean: sum / count as f64,
        });
    }
    for aggregate in merged {
        let (count, sum) = aggregate
            .members
            .iter()
            .filter_map(|member| accumulators.get(member))
            .fold((0usize, 0.0f64), |(count, sum), &(c, s)| {
                (count + c, sum + s)
            });
        if count == 0 {
            continue;
        }
        rows.push(StatsRow {
            index: 0,
            seg_id: aggregate.id,
            n_voxels: count,
            volume_mm3: count as f64 * voxel_volume,
            struct_name: aggregate.name.clone(),
            intensity_mean: sum / count as f64,
        });
    }

    rows.sort_by_key(|row| row.seg_id);
    for (position, row) in rows.iter_mut().enumerate() {
        row.index = position + 1;
    }
    StatsTable { rows, voxel_volume }
}

/// Render the stats file content
#[must_use]
pub fn render_stats_file(
    table: &StatsTable,
    seg_path: &Path,
    intensity_path: Option<&Path>,
    lut_path: &Path,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Title Cerebellum Segmentation Statistics");
    let _ = writeln!(out, "# generating_program cereb-seg");
    let _ = writeln!(out, "# SegVolFile {}", seg_path.display());
    if let Some(intensity) = intensity_path {
        let _ = writeln!(out, "# NormFile {}", intensity.display());
    }
    let _ = writeln!(out, "# ColorTable {}", lut_path.display());
    let _ = writeln!(out, "# VoxelVolume_mm3 {}", table.voxel_volume);
    let _ = writeln!(out, "# NRows {}", table.rows.len());
    let _ = writeln!(
        out,
        "# ColHeaders Index SegId NVoxels Volume_mm3 StructName normMean"
    );
    for row in &table.rows {
        let _ = writeln!(
            out,
            "{:>4} {:>6} {:>8} {:>12.3}  {:<34} {:>10.4}",
            row.index,
            row.seg_id,
            row.n_voxels,
            row.volume_mm3,
            row.struct_name,
            row.intensity_mean
        );
    }
    out
}

/// Persist a stats file
pub fn write_stats_file(
    path: &Path,
    table: &StatsTable,
    seg_path: &Path,
    intensity_path: Option<&Path>,
    lut_path: &Path,
) -> Result<()> {
    let content = render_stats_file(table, seg_path, intensity_path, lut_path);
    std::fs::write(path, content).map_err(|e| {
        SegError::Io(std::io::Error::new(
            e.kind(),
            format!("cannot write stats file {}: {e}", path.display()),
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn target_names() -> LabelMap<String, i64> {
        LabelMap::from_pairs(vec![
            ("Left_I_IV".to_string(), 601),
            ("Left_V".to_string(), 602),
            ("Right_I_IV".to_string(), 604),
            ("Right_V".to_string(), 605),
            ("Vermis_VI".to_string(), 610),
            ("Left_Corpus_Medullare".to_string(), 620),
            ("Right_Corpus_Medullare".to_string(), 621),
        ])
        .unwrap()
    }

    fn id_names() -> LabelMap<i64, String> {
        target_names().invert().unwrap()
    }

    #[test]
    fn test_merged_specs_match_prefixes_and_skip_white_matter() {
        let merged = merged_label_specs(&target_names(), &default_merge_rules());
        assert_eq!(merged.len(), 3);
        // Ids are allocated past the largest mapped id (621).
        assert_eq!(merged[0].id, 622);
        assert_eq!(merged[1].id, 623);
        assert_eq!(merged[2].id, 624);
        assert_eq!(merged[0].members, vec![601, 602]);
        assert_eq!(merged[1].members, vec![604, 605]);
        assert_eq!(merged[2].members, vec![610]);
    }

    #[test]
    fn test_zero_rows_dropped_sorted_and_reindexed() {
        let mut seg = Array3::<i64>::zeros((4, 4, 4));
        seg[[0, 0, 0]] = 621;
        seg[[0, 0, 1]] = 620;
        seg[[0, 0, 2]] = 620;
        let label_ids: Vec<i64> = target_names().values().copied().collect();
        let table = compute_region_stats(&seg, None, &label_ids, 1.0, &[], &id_names());

        // Only the two populated regions remain, in ascending id order.
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0].seg_id, 620);
        assert_eq!(table.rows[0].index, 1);
        assert_eq!(table.rows[0].n_voxels, 2);
        assert_eq!(table.rows[1].seg_id, 621);
        assert_eq!(table.rows[1].index, 2);
    }

    #[test]
    fn test_merged_labels_absorb_their_members() {
        let mut seg = Array3::<i64>::zeros((4, 4, 4));
        seg[[0, 0, 0]] = 601;
        seg[[0, 0, 1]] = 602;
        seg[[0, 0, 2]] = 610;
        seg[[0, 0, 3]] = 620;
        let names = target_names();
        let label_ids: Vec<i64> = names.values().copied().collect();
        let merged = merged_label_specs(&names, &default_merge_rules());
        let table = compute_region_stats(&seg, None, &label_ids, 1.0, &merged, &id_names());

        let ids: Vec<i64> = table.rows.iter().map(|row| row.seg_id).collect();
        // Members 601/602/610 are merged away; white matter stays itself.
        assert_eq!(ids, vec![620, 622, 624]);
        let left_gray = &table.rows[1];
        assert_eq!(left_gray.struct_name, "Left Cerebellar Gray Matter");
        assert_eq!(left_gray.n_voxels, 2);
        let vermis = &table.rows[2];
        assert_eq!(vermis.struct_name, "Vermis");
        assert_eq!(vermis.n_voxels, 1);
    }

    #[test]
    fn test_volume_scales_with_voxel_volume() {
        let mut seg = Array3::<i64>::zeros((2, 2, 2));
        seg[[0, 0, 0]] = 601;
        let table = compute_region_stats(&seg, None, &[601], 1.728, &[], &id_names());
        assert!((table.rows[0].volume_mm3 - 1.728).abs() < 1e-9);
    }

    #[test]
    fn test_intensity_mean() {
        let mut seg = Array3::<i64>::zeros((2, 2, 2));
        seg[[0, 0, 0]] = 601;
        seg[[0, 0, 1]] = 601;
        let mut norm = Array3::<f32>::zeros((2, 2, 2));
        norm[[0, 0, 0]] = 10.0;
        norm[[0, 0, 1]] = 30.0;
        let table =
            compute_region_stats(&seg, Some(&norm), &[601], 1.0, &[], &id_names());
        assert!((table.rows[0].intensity_mean - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_render_contains_provenance_and_rows() {
        let mut seg = Array3::<i64>::zeros((2, 2, 2));
        seg[[0, 0, 0]] = 601;
        let table = compute_region_stats(&seg, None, &[601], 1.0, &[], &id_names());
        let rendered = render_stats_file(
            &table,
            Path::new("/out/cereb.nii.gz"),
            Some(Path::new("/in/norm.nii")),
            Path::new("/config/target_lut.txt"),
        );
        assert!(rendered.contains("# SegVolFile /out/cereb.nii.gz"));
        assert!(rendered.contains("# NormFile /in/norm.nii"));
        assert!(rendered.contains("# NRows 1"));
        assert!(rendered.contains("Left_I_IV"));
    }
}
