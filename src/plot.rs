//! Snapshots → "top N guilds over time" line chart.
//!
//! The transform ([`build_chart`]) is kept apart from drawing
//! ([`render_svg`]) so the interesting part, which guild gets a point in which
//! slice, can be tested without touching plotters.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use plotters::prelude::*;
use tracing::{debug, info, warn};

use crate::store::{SnapshotStore, StoreError};

const CHART_SIZE: (u32, u32) = (1280, 720);
const LABEL_FORMAT: &str = "%m-%d %H:%M";

/// matplotlib's `tab10`.
const TAB10: [(u8, u8, u8); 10] = [
    (31, 119, 180),
    (255, 127, 14),
    (44, 160, 44),
    (214, 39, 40),
    (148, 103, 189),
    (140, 86, 75),
    (227, 119, 194),
    (127, 127, 127),
    (188, 189, 34),
    (23, 190, 207),
];

/// matplotlib's `tab20`.
const TAB20: [(u8, u8, u8); 20] = [
    (31, 119, 180),
    (174, 199, 232),
    (255, 127, 14),
    (255, 187, 120),
    (44, 160, 44),
    (152, 223, 138),
    (214, 39, 40),
    (255, 152, 150),
    (148, 103, 189),
    (197, 176, 213),
    (140, 86, 75),
    (196, 156, 148),
    (227, 119, 194),
    (247, 182, 210),
    (127, 127, 127),
    (199, 199, 199),
    (188, 189, 34),
    (219, 219, 141),
    (23, 190, 207),
    (158, 218, 229),
];

#[derive(Debug, thiserror::Error)]
pub enum PlotError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to create {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to render chart: {0}")]
    Render(String),
    #[error("no snapshots to plot")]
    NoData,
}

fn render_err<E: std::fmt::Display>(e: E) -> PlotError {
    PlotError::Render(e.to_string())
}

// ---------------------------------------------------------------------------
// Data
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuildPoint {
    pub name: String,
    pub online: u64,
    pub members: u64,
}

/// One snapshot as the chart sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeSlice {
    pub taken_at: NaiveDateTime,
    pub guilds: Vec<GuildPoint>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Series {
    pub label: String,
    /// One entry per slice; `None` where the guild wasn't in that slice's top.
    pub values: Vec<Option<u64>>,
}

impl Series {
    /// Contiguous runs of present values, paired with their x coordinates.
    pub fn segments<X: Copy>(&self, xs: &[X]) -> Vec<Vec<(X, u64)>> {
        let mut segments = Vec::new();
        let mut current = Vec::new();
        for (x, value) in xs.iter().zip(&self.values) {
            match value {
                Some(v) => current.push((*x, *v)),
                None if !current.is_empty() => segments.push(std::mem::take(&mut current)),
                None => {}
            }
        }
        if !current.is_empty() {
            segments.push(current);
        }
        segments
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chart {
    pub title: String,
    pub x: Vec<NaiveDateTime>,
    /// In order of first appearance.
    pub series: Vec<Series>,
}

impl Chart {
    pub fn max_value(&self) -> u64 {
        self.series
            .iter()
            .flat_map(|s| s.values.iter().flatten())
            .copied()
            .max()
            .unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Transform
// ---------------------------------------------------------------------------

/// The `n` largest guilds by member count (all of them for `None`). Ties keep
/// their input order.
pub fn top_n(slice: &TimeSlice, n: Option<usize>) -> Vec<&GuildPoint> {
    let mut ranked: Vec<&GuildPoint> = slice.guilds.iter().collect();
    ranked.sort_by(|a, b| b.members.cmp(&a.members));
    if let Some(n) = n {
        ranked.truncate(n);
    }
    ranked
}

/// One line per guild name that ever made a slice's top `n`.
pub fn build_chart(slices: &[TimeSlice], n: Option<usize>, title: impl Into<String>) -> Chart {
    let mut series: Vec<Series> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for (i, slice) in slices.iter().enumerate() {
        for point in top_n(slice, n) {
            let at = *index.entry(point.name.clone()).or_insert_with(|| {
                series.push(Series {
                    label: point.name.clone(),
                    values: Vec::new(),
                });
                series.len() - 1
            });
            let values = &mut series[at].values;
            values.resize(i, None);
            values.push(Some(point.members));
        }
    }

    for line in &mut series {
        line.values.resize(slices.len(), None);
    }

    Chart {
        title: title.into(),
        x: slices.iter().map(|s| s.taken_at).collect(),
        series,
    }
}

/// Every snapshot on disk, reduced to what the chart needs, oldest first.
/// Snapshots that fail to load are skipped with a warning.
pub fn load_slices(store: &SnapshotStore) -> Result<Vec<TimeSlice>, StoreError> {
    let mut slices = Vec::new();
    for file in store.list_snapshots()? {
        let snapshot = match store.load_snapshot(&file.path) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(path = %file.path.display(), error = %e, "skipping unreadable snapshot");
                continue;
            }
        };
        let guilds = snapshot
            .into_values()
            .map(|g| GuildPoint {
                name: g.name,
                online: g.approximate_presence_count,
                members: g.approximate_member_count,
            })
            .collect();
        slices.push(TimeSlice {
            taken_at: file.taken_at,
            guilds,
        });
    }
    Ok(slices)
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

/// `top 10 members over time` → `top_10_members_over_time.svg`
pub fn output_file_name(title: &str) -> String {
    format!("{}.svg", title.replace(' ', "_"))
}

fn palette(lines: usize) -> &'static [(u8, u8, u8)] {
    if lines > TAB10.len() {
        &TAB20
    } else {
        &TAB10
    }
}

fn timestamp(at: &NaiveDateTime) -> i64 {
    at.and_utc().timestamp()
}

fn format_timestamp(ts: &i64) -> String {
    chrono::DateTime::from_timestamp(*ts, 0)
        .map(|dt| dt.naive_utc().format(LABEL_FORMAT).to_string())
        .unwrap_or_default()
}

/// Draw `chart` as an SVG line chart at `path`.
pub fn render_svg(chart: &Chart, path: &Path) -> Result<(), PlotError> {
    if chart.x.is_empty() {
        return Err(PlotError::NoData);
    }

    let xs: Vec<i64> = chart.x.iter().map(timestamp).collect();
    let x_min = xs.iter().copied().min().unwrap_or(0);
    let mut x_max = xs.iter().copied().max().unwrap_or(0);
    if x_max <= x_min {
        // a single slice still needs a non-empty axis
        x_max = x_min + 3600;
    }
    let y_max = (chart.max_value() + chart.max_value() / 20).max(1);

    let root = SVGBackend::new(path, CHART_SIZE).into_drawing_area();
    root.fill(&WHITE).map_err(render_err)?;

    let mut ctx = ChartBuilder::on(&root)
        .caption(&chart.title, ("sans-serif", 24))
        .margin(20)
        .x_label_area_size(50)
        .y_label_area_size(80)
        .build_cartesian_2d(x_min..x_max, 0u64..y_max)
        .map_err(render_err)?;

    ctx.configure_mesh()
        .x_desc("date")
        .y_desc("member")
        .x_labels(8)
        .x_label_formatter(&format_timestamp)
        .draw()
        .map_err(render_err)?;

    let colors = palette(chart.series.len());
    for (i, series) in chart.series.iter().enumerate() {
        let (r, g, b) = colors[i % colors.len()];
        let style = ShapeStyle::from(&RGBColor(r, g, b)).stroke_width(2);

        for (n, segment) in series.segments(&xs).into_iter().enumerate() {
            ctx.draw_series(segment.iter().map(|&point| Circle::new(point, 3, style.filled())))
                .map_err(render_err)?;
            let drawn = ctx
                .draw_series(LineSeries::new(segment, style))
                .map_err(render_err)?;
            if n == 0 {
                drawn
                    .label(series.label.clone())
                    .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], style));
            }
        }
    }

    ctx.configure_series_labels()
        .position(SeriesLabelPosition::UpperLeft)
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()
        .map_err(render_err)?;

    root.present().map_err(render_err)?;
    Ok(())
}

/// Load every snapshot, chart the top `n` guilds by members, and write the
/// chart into `output_dir`. Returns the written path.
pub fn plot_graphs(
    store: &SnapshotStore,
    output_dir: &Path,
    n: usize,
) -> Result<PathBuf, PlotError> {
    let slices = load_slices(store)?;
    debug!(slices = slices.len(), "loaded snapshots for plotting");

    let chart = build_chart(&slices, Some(n), format!("top {} members over time", n));

    fs::create_dir_all(output_dir).map_err(|source| PlotError::Io {
        path: output_dir.to_path_buf(),
        source,
    })?;
    let path = output_dir.join(output_file_name(&chart.title));
    render_svg(&chart, &path)?;

    info!(path = %path.display(), lines = chart.series.len(), "member graph written");
    Ok(path)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GuildMap, GuildRecord};
    use chrono::NaiveDate;

    fn at(hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2020, 5, 17)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    fn slice(hour: u32, guilds: &[(&str, u64)]) -> TimeSlice {
        TimeSlice {
            taken_at: at(hour),
            guilds: guilds
                .iter()
                .map(|(name, members)| GuildPoint {
                    name: name.to_string(),
                    online: members / 2,
                    members: *members,
                })
                .collect(),
        }
    }

    // -- top_n -------------------------------------------------------------

    #[test]
    fn top_n_sorts_descending_and_truncates() {
        let s = slice(0, &[("a", 5), ("b", 50), ("c", 20), ("d", 1)]);
        let names: Vec<_> = top_n(&s, Some(2)).iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["b", "c"]);
    }

    #[test]
    fn top_n_without_limit_keeps_all() {
        let s = slice(0, &[("a", 5), ("b", 50)]);
        assert_eq!(top_n(&s, None).len(), 2);
        assert_eq!(top_n(&s, Some(10)).len(), 2);
    }

    #[test]
    fn top_n_ties_keep_input_order() {
        let s = slice(0, &[("first", 7), ("second", 7), ("third", 7)]);
        let names: Vec<_> = top_n(&s, Some(2)).iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    // -- build_chart -------------------------------------------------------

    #[test]
    fn guilds_entering_and_leaving_the_top_are_padded() {
        let slices = vec![
            slice(0, &[("a", 100), ("b", 90), ("c", 10)]),
            slice(1, &[("a", 110), ("c", 95), ("b", 80)]),
            slice(2, &[("a", 120), ("b", 99), ("c", 5)]),
        ];
        let chart = build_chart(&slices, Some(2), "t");

        assert_eq!(chart.x, vec![at(0), at(1), at(2)]);
        let labels: Vec<_> = chart.series.iter().map(|s| s.label.as_str()).collect();
        assert_eq!(labels, vec!["a", "b", "c"]);

        assert_eq!(chart.series[0].values, vec![Some(100), Some(110), Some(120)]);
        assert_eq!(chart.series[1].values, vec![Some(90), None, Some(99)]);
        assert_eq!(chart.series[2].values, vec![None, Some(95), None]);
    }

    #[test]
    fn every_line_spans_all_slices() {
        let slices = vec![slice(0, &[("early", 10)]), slice(1, &[]), slice(2, &[])];
        let chart = build_chart(&slices, Some(10), "t");
        assert_eq!(chart.series[0].values, vec![Some(10), None, None]);
    }

    #[test]
    fn no_slices_means_empty_chart() {
        let chart = build_chart(&[], Some(10), "empty");
        assert!(chart.x.is_empty());
        assert!(chart.series.is_empty());
        assert_eq!(chart.max_value(), 0);
    }

    #[test]
    fn segments_break_at_gaps() {
        let series = Series {
            label: "x".into(),
            values: vec![Some(1), Some(2), None, Some(4), None, None, Some(7)],
        };
        let xs = [0, 1, 2, 3, 4, 5, 6];
        assert_eq!(
            series.segments(&xs),
            vec![vec![(0, 1), (1, 2)], vec![(3, 4)], vec![(6, 7)]]
        );
    }

    #[test]
    fn output_file_name_replaces_spaces() {
        assert_eq!(
            output_file_name("top 10 members over time"),
            "top_10_members_over_time.svg"
        );
    }

    #[test]
    fn palette_switches_above_ten_lines() {
        assert_eq!(palette(10).len(), 10);
        assert_eq!(palette(11).len(), 20);
    }

    #[test]
    fn timestamp_labels_round_trip() {
        assert_eq!(format_timestamp(&timestamp(&at(13))), "05-17 13:00");
    }

    // -- End to end --------------------------------------------------------

    #[test]
    fn plot_graphs_reads_snapshots_and_writes_svg() {
        let data = tempfile::tempdir().unwrap();
        let out = data.path().join("output");
        let store = SnapshotStore::new(data.path());

        for (hour, members) in [(1, 100), (2, 150), (3, 130)] {
            let mut guilds = GuildMap::new();
            guilds.insert(
                "1".into(),
                GuildRecord::new("1", "Alpha").with_counts(members, 10),
            );
            guilds.insert("2".into(), GuildRecord::new("2", "Beta").with_counts(70, 5));
            store.write_snapshot(&guilds, at(hour)).unwrap();
        }

        let slices = load_slices(&store).unwrap();
        assert_eq!(slices.len(), 3);
        assert_eq!(slices[1].taken_at, at(2));

        let path = plot_graphs(&store, &out, 10).unwrap();
        assert_eq!(path, out.join("top_10_members_over_time.svg"));
        let svg = fs::read_to_string(&path).unwrap();
        assert!(svg.contains("<svg"));
        assert!(svg.contains("Alpha"));
        assert!(svg.contains("Beta"));
    }

    #[test]
    fn truncated_snapshot_is_skipped() {
        let data = tempfile::tempdir().unwrap();
        let out = data.path().join("output");
        let store = SnapshotStore::new(data.path());

        let mut guilds = GuildMap::new();
        guilds.insert("1".into(), GuildRecord::new("1", "Alpha").with_counts(100, 10));
        store.write_snapshot(&guilds, at(1)).unwrap();
        fs::write(
            store.snapshot_dir().join("guild_list_20200517-0200.json"),
            r#"{"1": {"id": "1", "name": "Alp"#,
        )
        .unwrap();

        let slices = load_slices(&store).unwrap();
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].taken_at, at(1));

        let path = plot_graphs(&store, &out, 10).unwrap();
        assert!(fs::read_to_string(&path).unwrap().contains("Alpha"));
    }

    #[test]
    fn plot_graphs_without_snapshots_is_no_data() {
        let data = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(data.path());
        let err = plot_graphs(&store, &data.path().join("output"), 10).unwrap_err();
        assert!(matches!(err, PlotError::NoData));
    }
}
