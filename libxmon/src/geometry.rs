// The geometry description is a flat list of `[group/]key = value` assignments. Keys
// without a group are defaults which get copied into every panel that shows up *after*
// them, so a panel is a snapshot of the defaults at the moment its name is first seen,
// plus whatever it overrides itself. Groups named bad* are exclusion regions, and the
// rigid_group_* keys live at the top level. Nothing is validated until the whole text
// has been read, since later lines are allowed to complete earlier panels.
use std::collections::BTreeMap;
use std::path::Path;

use fxhash::FxHashMap;
use ndarray::Array2;

use super::error::GeometryParseError;
use super::pixel_maps::PixelMaps;

const BAD_REGION_PREFIX: &str = "bad";
const RIGID_GROUP_PREFIX: &str = "rigid_group_";
const RIGID_GROUP_COLLECTION_PREFIX: &str = "rigid_group_collection_";
const DEFAULT_MASK_GOOD: u16 = 0x0000;
const DEFAULT_MASK_BAD: u16 = 0x0000;

/// A direction in lab space. Only x and y take part in the slab -> physical mapping,
/// z is carried for completeness.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vector3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

/// Tag for one axis of the raw data array
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimTag {
    SlowScan,
    FastScan,
    Placeholder,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AduConversion {
    PerEv(f64),
    PerPhoton(f64),
}

/// The camera length is either a literal value (m) or the name of an event metadata
/// entry which provides it per event.
#[derive(Debug, Clone, PartialEq)]
pub enum CameraLength {
    Fixed(f64),
    FromMetadata(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BadRowDirection {
    #[default]
    None,
    Fast,
    Slow,
}

/// A rectangular region of the slab with its own placement in the lab.
#[derive(Debug, Clone, PartialEq)]
pub struct Panel {
    pub name: String,
    pub min_fs: usize,
    pub max_fs: usize,
    pub min_ss: usize,
    pub max_ss: usize,
    pub corner_x: f64,
    pub corner_y: f64,
    pub fast_axis: Vector3,
    pub slow_axis: Vector3,
    /// Pixels per metre
    pub resolution: f64,
    pub camera_length: CameraLength,
    pub camera_length_offset: f64,
    pub adu_conversion: AduConversion,
    pub max_adu: f64,
    pub bad_row_direction: BadRowDirection,
    pub no_index: bool,
    pub mask: Option<String>,
    pub mask_file: Option<String>,
    pub dim_structure: Vec<DimTag>,
}

impl Panel {
    pub fn width(&self) -> usize {
        self.max_fs - self.min_fs + 1
    }

    pub fn height(&self) -> usize {
        self.max_ss - self.min_ss + 1
    }

    /// In-plane determinant of the (fs, ss) basis
    pub fn basis_determinant(&self) -> f64 {
        self.fast_axis.x * self.slow_axis.y - self.slow_axis.x * self.fast_axis.y
    }

    pub fn contains(&self, ss: usize, fs: usize) -> bool {
        (self.min_ss..=self.max_ss).contains(&ss) && (self.min_fs..=self.max_fs).contains(&fs)
    }

    pub fn placeholder_count(&self) -> usize {
        self.dim_structure
            .iter()
            .filter(|d| **d == DimTag::Placeholder)
            .count()
    }

    fn overlaps(&self, other: &Panel) -> bool {
        self.min_fs <= other.max_fs
            && other.min_fs <= self.max_fs
            && self.min_ss <= other.max_ss
            && other.min_ss <= self.max_ss
    }
}

/// A named exclusion rectangle, in either lab or slab coordinates
#[derive(Debug, Clone, PartialEq)]
pub enum BadRegion {
    Physical {
        name: String,
        min_x: f64,
        max_x: f64,
        min_y: f64,
        max_y: f64,
    },
    Slab {
        name: String,
        panel: Option<String>,
        min_fs: usize,
        max_fs: usize,
        min_ss: usize,
        max_ss: usize,
    },
}

impl BadRegion {
    pub fn name(&self) -> &str {
        match self {
            Self::Physical { name, .. } => name,
            Self::Slab { name, .. } => name,
        }
    }
}

/// The validated detector model. Immutable once loaded.
#[derive(Debug, Clone)]
pub struct Detector {
    panels: Vec<Panel>,
    index: FxHashMap<String, usize>,
    pub bad_regions: Vec<BadRegion>,
    pub mask_good: u16,
    pub mask_bad: u16,
    pub photon_energy: Option<f64>,
    pub rigid_groups: BTreeMap<String, Vec<String>>,
    pub rigid_group_collections: BTreeMap<String, Vec<String>>,
}

impl Detector {
    /// Read and parse a geometry description file
    pub fn from_file(path: &Path) -> Result<Self, GeometryParseError> {
        let contents = std::fs::read_to_string(path)?;
        Self::load(&contents)
    }

    /// Parse a geometry description, then run both validation passes over the result
    pub fn load(description: &str) -> Result<Self, GeometryParseError> {
        let mut parser = GeometryParser::default();
        for (idx, line) in description.lines().enumerate() {
            parser.parse_line(idx + 1, line)?;
        }
        parser.finish()
    }

    pub fn panels(&self) -> &[Panel] {
        &self.panels
    }

    pub fn panel(&self, name: &str) -> Option<&Panel> {
        self.index.get(name).map(|idx| &self.panels[*idx])
    }

    /// Shape (ss, fs) of the full slab array covering every panel
    pub fn slab_shape(&self) -> (usize, usize) {
        let height = self.panels.iter().map(|p| p.max_ss + 1).max().unwrap_or(0);
        let width = self.panels.iter().map(|p| p.max_fs + 1).max().unwrap_or(0);
        (height, width)
    }

    /// Detector-wide resolution in pixels per metre. Taken from the first panel.
    pub fn resolution(&self) -> f64 {
        self.panels[0].resolution
    }

    /// Detector-wide camera length offset in metres. Taken from the first panel.
    pub fn coffset(&self) -> f64 {
        self.panels[0].camera_length_offset
    }

    /// Build the slab-shaped bad pixel mask (true means bad) from no_index panels and
    /// every bad region.
    pub fn bad_pixel_mask(&self, maps: &PixelMaps) -> Array2<bool> {
        let mut mask = Array2::from_elem(self.slab_shape(), false);
        for panel in self.panels.iter().filter(|p| p.no_index) {
            mask.slice_mut(ndarray::s![
                panel.min_ss..=panel.max_ss,
                panel.min_fs..=panel.max_fs
            ])
            .fill(true);
        }

        for region in self.bad_regions.iter() {
            match region {
                BadRegion::Physical {
                    min_x,
                    max_x,
                    min_y,
                    max_y,
                    ..
                } => {
                    for ((idx, x), y) in maps.x.indexed_iter().zip(maps.y.iter()) {
                        if (*min_x..=*max_x).contains(x) && (*min_y..=*max_y).contains(y) {
                            mask[idx] = true;
                        }
                    }
                }
                BadRegion::Slab {
                    panel,
                    min_fs,
                    max_fs,
                    min_ss,
                    max_ss,
                    ..
                } => {
                    let restrict = panel.as_deref().and_then(|name| self.panel(name));
                    for ss in *min_ss..=(*max_ss).min(mask.nrows().saturating_sub(1)) {
                        for fs in *min_fs..=(*max_fs).min(mask.ncols().saturating_sub(1)) {
                            if restrict.map_or(true, |p| p.contains(ss, fs)) {
                                mask[[ss, fs]] = true;
                            }
                        }
                    }
                }
            }
        }
        mask
    }
}

/// Panel fields as they accumulate during parsing. Also used for the detector-wide
/// defaults.
#[derive(Debug, Clone, Default)]
struct PanelTemplate {
    min_fs: Option<usize>,
    max_fs: Option<usize>,
    min_ss: Option<usize>,
    max_ss: Option<usize>,
    corner_x: Option<f64>,
    corner_y: Option<f64>,
    fast_axis: Option<Vector3>,
    slow_axis: Option<Vector3>,
    resolution: Option<f64>,
    clen: Option<f64>,
    clen_from: Option<String>,
    coffset: Option<f64>,
    adu_per_ev: Option<f64>,
    adu_per_photon: Option<f64>,
    max_adu: Option<f64>,
    bad_row_direction: Option<BadRowDirection>,
    no_index: Option<bool>,
    mask: Option<String>,
    mask_file: Option<String>,
    dims: BTreeMap<usize, DimTag>,
}

impl PanelTemplate {
    /// Apply a panel-level key. Returns false if the key is not a panel key.
    fn apply(&mut self, key: &str, value: &str) -> Result<bool, GeometryParseError> {
        match key {
            "min_fs" => self.min_fs = Some(parse_integer(key, value)?),
            "max_fs" => self.max_fs = Some(parse_integer(key, value)?),
            "min_ss" => self.min_ss = Some(parse_integer(key, value)?),
            "max_ss" => self.max_ss = Some(parse_integer(key, value)?),
            "corner_x" => self.corner_x = Some(parse_float(key, value)?),
            "corner_y" => self.corner_y = Some(parse_float(key, value)?),
            "fs" => self.fast_axis = Some(parse_axis(key, value)?),
            "ss" => self.slow_axis = Some(parse_axis(key, value)?),
            "res" => self.resolution = Some(parse_float(key, value)?),
            "clen" => self.clen = Some(parse_float(key, value)?),
            "clen_from" => self.clen_from = Some(value.to_string()),
            "coffset" => self.coffset = Some(parse_float(key, value)?),
            "adu_per_eV" => self.adu_per_ev = Some(parse_float(key, value)?),
            "adu_per_photon" => self.adu_per_photon = Some(parse_float(key, value)?),
            "max_adu" => self.max_adu = Some(parse_float(key, value)?),
            "badrow_direction" => {
                self.bad_row_direction = Some(match value {
                    "f" | "x" => BadRowDirection::Fast,
                    "s" | "y" => BadRowDirection::Slow,
                    "-" => BadRowDirection::None,
                    _ => {
                        return Err(GeometryParseError::BadAxis {
                            key: key.to_string(),
                            value: value.to_string(),
                        })
                    }
                })
            }
            "no_index" => self.no_index = Some(parse_integer(key, value)? != 0),
            "mask" => self.mask = Some(value.to_string()),
            "mask_file" => self.mask_file = Some(value.to_string()),
            _ => {
                if let Some(dim) = key.strip_prefix("dim") {
                    let index: usize = dim.parse().map_err(|_| {
                        GeometryParseError::UnknownKey(key.to_string())
                    })?;
                    let tag = match value {
                        "ss" => DimTag::SlowScan,
                        "fs" => DimTag::FastScan,
                        "%" => DimTag::Placeholder,
                        _ => {
                            return Err(GeometryParseError::BadDimension {
                                key: key.to_string(),
                                value: value.to_string(),
                            })
                        }
                    };
                    self.dims.insert(index, tag);
                } else {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// First validation pass: every required field present and consistent
    fn build(self, name: &str) -> Result<Panel, GeometryParseError> {
        let missing = |key: &'static str| GeometryParseError::MissingKey {
            panel: name.to_string(),
            key,
        };
        let min_fs = self.min_fs.ok_or_else(|| missing("min_fs"))?;
        let max_fs = self.max_fs.ok_or_else(|| missing("max_fs"))?;
        let min_ss = self.min_ss.ok_or_else(|| missing("min_ss"))?;
        let max_ss = self.max_ss.ok_or_else(|| missing("max_ss"))?;
        let corner_x = self.corner_x.ok_or_else(|| missing("corner_x"))?;
        let corner_y = self.corner_y.ok_or_else(|| missing("corner_y"))?;
        let resolution = self.resolution.ok_or_else(|| missing("res"))?;

        let adu_conversion = match (self.adu_per_ev, self.adu_per_photon) {
            (Some(_), Some(_)) => {
                return Err(GeometryParseError::ConflictingAduConversion(
                    name.to_string(),
                ))
            }
            (Some(v), None) => AduConversion::PerEv(v),
            (None, Some(v)) => AduConversion::PerPhoton(v),
            (None, None) => return Err(missing("adu_per_eV")),
        };

        // A literal clen wins over a metadata reference inherited from the defaults
        let camera_length = match (self.clen, self.clen_from) {
            (Some(v), _) => CameraLength::Fixed(v),
            (None, Some(path)) => CameraLength::FromMetadata(path),
            (None, None) => return Err(missing("clen")),
        };

        if resolution <= 0.0 {
            return Err(GeometryParseError::NonPositiveResolution(name.to_string()));
        }

        let dim_structure = build_dim_structure(name, &self.dims)?;

        Ok(Panel {
            name: name.to_string(),
            min_fs,
            max_fs,
            min_ss,
            max_ss,
            corner_x,
            corner_y,
            fast_axis: self.fast_axis.unwrap_or(Vector3::new(1.0, 0.0, 0.0)),
            slow_axis: self.slow_axis.unwrap_or(Vector3::new(0.0, 1.0, 0.0)),
            resolution,
            camera_length,
            camera_length_offset: self.coffset.unwrap_or(0.0),
            adu_conversion,
            max_adu: self.max_adu.unwrap_or(f64::INFINITY),
            bad_row_direction: self.bad_row_direction.unwrap_or_default(),
            no_index: self.no_index.unwrap_or(false),
            mask: self.mask,
            mask_file: self.mask_file,
            dim_structure,
        })
    }
}

/// A panel with no dimN keys is a plain 2D [ss, fs] array. Once any dimN is given the
/// whole structure has to be spelled out.
fn build_dim_structure(
    name: &str,
    dims: &BTreeMap<usize, DimTag>,
) -> Result<Vec<DimTag>, GeometryParseError> {
    if dims.is_empty() {
        return Ok(vec![DimTag::SlowScan, DimTag::FastScan]);
    }
    let ambiguous = |reason: &str| GeometryParseError::AmbiguousDimStructure {
        panel: name.to_string(),
        reason: reason.to_string(),
    };
    for (expected, index) in dims.keys().enumerate() {
        if expected != *index {
            return Err(ambiguous("dimension indices are not contiguous from dim0"));
        }
    }
    let structure: Vec<DimTag> = dims.values().copied().collect();
    let n_ss = structure.iter().filter(|d| **d == DimTag::SlowScan).count();
    let n_fs = structure.iter().filter(|d| **d == DimTag::FastScan).count();
    if n_ss != 1 || n_fs != 1 {
        return Err(ambiguous("exactly one ss and one fs dimension are required"));
    }
    Ok(structure)
}

#[derive(Debug, Clone, Default)]
struct BadRegionTemplate {
    min_x: Option<f64>,
    max_x: Option<f64>,
    min_y: Option<f64>,
    max_y: Option<f64>,
    min_fs: Option<usize>,
    max_fs: Option<usize>,
    min_ss: Option<usize>,
    max_ss: Option<usize>,
    panel: Option<String>,
}

impl BadRegionTemplate {
    fn apply(&mut self, key: &str, value: &str) -> Result<(), GeometryParseError> {
        match key {
            "min_x" => self.min_x = Some(parse_float(key, value)?),
            "max_x" => self.max_x = Some(parse_float(key, value)?),
            "min_y" => self.min_y = Some(parse_float(key, value)?),
            "max_y" => self.max_y = Some(parse_float(key, value)?),
            "min_fs" => self.min_fs = Some(parse_integer(key, value)?),
            "max_fs" => self.max_fs = Some(parse_integer(key, value)?),
            "min_ss" => self.min_ss = Some(parse_integer(key, value)?),
            "max_ss" => self.max_ss = Some(parse_integer(key, value)?),
            "panel" => self.panel = Some(value.to_string()),
            _ => return Err(GeometryParseError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    fn build(self, name: &str) -> Result<BadRegion, GeometryParseError> {
        let has_xy = self.min_x.is_some()
            || self.max_x.is_some()
            || self.min_y.is_some()
            || self.max_y.is_some();
        let has_slab = self.min_fs.is_some()
            || self.max_fs.is_some()
            || self.min_ss.is_some()
            || self.max_ss.is_some();
        if has_xy && has_slab {
            return Err(GeometryParseError::MixedBadRegion(name.to_string()));
        }
        let incomplete = || GeometryParseError::IncompleteBadRegion(name.to_string());
        if has_xy {
            if self.panel.is_some() {
                return Err(GeometryParseError::MixedBadRegion(name.to_string()));
            }
            Ok(BadRegion::Physical {
                name: name.to_string(),
                min_x: self.min_x.ok_or_else(incomplete)?,
                max_x: self.max_x.ok_or_else(incomplete)?,
                min_y: self.min_y.ok_or_else(incomplete)?,
                max_y: self.max_y.ok_or_else(incomplete)?,
            })
        } else if has_slab {
            Ok(BadRegion::Slab {
                name: name.to_string(),
                panel: self.panel,
                min_fs: self.min_fs.ok_or_else(incomplete)?,
                max_fs: self.max_fs.ok_or_else(incomplete)?,
                min_ss: self.min_ss.ok_or_else(incomplete)?,
                max_ss: self.max_ss.ok_or_else(incomplete)?,
            })
        } else {
            Err(incomplete())
        }
    }
}

#[derive(Debug, Default)]
struct GeometryParser {
    defaults: PanelTemplate,
    panels: Vec<(String, PanelTemplate)>,
    panel_index: FxHashMap<String, usize>,
    bad_regions: Vec<(String, BadRegionTemplate)>,
    mask_good: Option<u16>,
    mask_bad: Option<u16>,
    photon_energy: Option<f64>,
    rigid_groups: BTreeMap<String, Vec<String>>,
    rigid_group_collections: BTreeMap<String, Vec<String>>,
}

impl GeometryParser {
    fn parse_line(&mut self, line_number: usize, line: &str) -> Result<(), GeometryParseError> {
        let content = match line.find(';') {
            Some(pos) => &line[..pos],
            None => line,
        }
        .trim();
        if content.is_empty() {
            return Ok(());
        }

        let (key, value) = match content.split_once('=') {
            Some((k, v)) if !k.trim().is_empty() && !v.trim().is_empty() => (k.trim(), v.trim()),
            _ => return Err(GeometryParseError::BadLine(line_number, line.to_string())),
        };

        match key.split_once('/') {
            Some((group, subkey)) => self.apply_group_key(group.trim(), subkey.trim(), value),
            None => self.apply_toplevel_key(key, value),
        }
    }

    fn apply_group_key(
        &mut self,
        group: &str,
        key: &str,
        value: &str,
    ) -> Result<(), GeometryParseError> {
        if group.starts_with(BAD_REGION_PREFIX) {
            let idx = match self.bad_regions.iter().position(|(name, _)| name == group) {
                Some(idx) => idx,
                None => {
                    self.bad_regions
                        .push((group.to_string(), BadRegionTemplate::default()));
                    self.bad_regions.len() - 1
                }
            };
            return self.bad_regions[idx].1.apply(key, value);
        }

        let idx = match self.panel_index.get(group) {
            Some(idx) => *idx,
            None => {
                // New panel: snapshot of the defaults as they are right now
                self.panels.push((group.to_string(), self.defaults.clone()));
                self.panel_index
                    .insert(group.to_string(), self.panels.len() - 1);
                self.panels.len() - 1
            }
        };
        if self.panels[idx].1.apply(key, value)? {
            Ok(())
        } else {
            Err(GeometryParseError::UnknownKey(format!("{group}/{key}")))
        }
    }

    fn apply_toplevel_key(&mut self, key: &str, value: &str) -> Result<(), GeometryParseError> {
        if let Some(name) = key.strip_prefix(RIGID_GROUP_COLLECTION_PREFIX) {
            self.rigid_group_collections
                .insert(name.to_string(), split_list(value));
        } else if let Some(name) = key.strip_prefix(RIGID_GROUP_PREFIX) {
            self.rigid_groups.insert(name.to_string(), split_list(value));
        } else {
            match key {
                "mask_good" => self.mask_good = Some(parse_bits(key, value)?),
                "mask_bad" => self.mask_bad = Some(parse_bits(key, value)?),
                "photon_energy" => self.photon_energy = Some(parse_float(key, value)?),
                _ => {
                    if !self.defaults.apply(key, value)? {
                        return Err(GeometryParseError::UnknownKey(key.to_string()));
                    }
                }
            }
        }
        Ok(())
    }

    fn finish(self) -> Result<Detector, GeometryParseError> {
        if self.panels.is_empty() {
            return Err(GeometryParseError::NoPanels);
        }

        // Pass 1: completeness of every panel
        let mut panels = Vec::with_capacity(self.panels.len());
        for (name, template) in self.panels {
            panels.push(template.build(&name)?);
        }

        // Pass 2: extents and basis
        for panel in panels.iter() {
            if panel.max_fs < panel.min_fs {
                return Err(GeometryParseError::InvertedBounds {
                    panel: panel.name.clone(),
                    axis: "fs",
                });
            }
            if panel.max_ss < panel.min_ss {
                return Err(GeometryParseError::InvertedBounds {
                    panel: panel.name.clone(),
                    axis: "ss",
                });
            }
            if panel.basis_determinant() == 0.0 {
                return Err(GeometryParseError::SingularBasis(panel.name.clone()));
            }
        }

        let expected_placeholders = panels[0].placeholder_count();
        for panel in panels.iter() {
            if panel.placeholder_count() != expected_placeholders {
                return Err(GeometryParseError::PlaceholderMismatch {
                    panel: panel.name.clone(),
                    expected: expected_placeholders,
                    found: panel.placeholder_count(),
                });
            }
        }

        for (i, first) in panels.iter().enumerate() {
            for second in panels.iter().skip(i + 1) {
                if first.overlaps(second) {
                    return Err(GeometryParseError::OverlappingPanels(
                        first.name.clone(),
                        second.name.clone(),
                    ));
                }
            }
        }

        let index: FxHashMap<String, usize> = panels
            .iter()
            .enumerate()
            .map(|(idx, p)| (p.name.clone(), idx))
            .collect();

        for (group, members) in self.rigid_groups.iter() {
            for member in members {
                if !index.contains_key(member) {
                    return Err(GeometryParseError::UnknownPanel {
                        owner: format!("Rigid group {group}"),
                        panel: member.clone(),
                    });
                }
            }
        }
        for (collection, groups) in self.rigid_group_collections.iter() {
            for group in groups {
                if !self.rigid_groups.contains_key(group) {
                    return Err(GeometryParseError::UnknownRigidGroup {
                        collection: collection.clone(),
                        group: group.clone(),
                    });
                }
            }
        }

        let mut bad_regions = Vec::with_capacity(self.bad_regions.len());
        for (name, template) in self.bad_regions {
            let region = template.build(&name)?;
            if let BadRegion::Slab {
                panel: Some(panel), ..
            } = &region
            {
                if !index.contains_key(panel) {
                    return Err(GeometryParseError::UnknownPanel {
                        owner: format!("Bad region {name}"),
                        panel: panel.clone(),
                    });
                }
            }
            bad_regions.push(region);
        }

        Ok(Detector {
            panels,
            index,
            bad_regions,
            mask_good: self.mask_good.unwrap_or(DEFAULT_MASK_GOOD),
            mask_bad: self.mask_bad.unwrap_or(DEFAULT_MASK_BAD),
            photon_energy: self.photon_energy,
            rigid_groups: self.rigid_groups,
            rigid_group_collections: self.rigid_group_collections,
        })
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse_float(key: &str, value: &str) -> Result<f64, GeometryParseError> {
    value.parse().map_err(|_| GeometryParseError::BadNumber {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_integer(key: &str, value: &str) -> Result<usize, GeometryParseError> {
    value.parse().map_err(|_| GeometryParseError::BadNumber {
        key: key.to_string(),
        value: value.to_string(),
    })
}

/// Mask bit values are usually written in hex (0x2000) but decimal is fine too
fn parse_bits(key: &str, value: &str) -> Result<u16, GeometryParseError> {
    let parsed = match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|_| GeometryParseError::BadNumber {
        key: key.to_string(),
        value: value.to_string(),
    })
}

/// Parse axis notation like `+0.998x -0.05y` or `-y`
fn parse_axis(key: &str, value: &str) -> Result<Vector3, GeometryParseError> {
    let bad = || GeometryParseError::BadAxis {
        key: key.to_string(),
        value: value.to_string(),
    };
    let mut axis = Vector3::default();
    let mut coefficient = String::new();
    let mut n_terms = 0;
    for c in value.chars().filter(|c| !c.is_whitespace()) {
        match c {
            'x' | 'y' | 'z' => {
                let k = match coefficient.as_str() {
                    "" | "+" => 1.0,
                    "-" => -1.0,
                    number => number.parse::<f64>().map_err(|_| bad())?,
                };
                match c {
                    'x' => axis.x += k,
                    'y' => axis.y += k,
                    _ => axis.z += k,
                }
                coefficient.clear();
                n_terms += 1;
            }
            _ => coefficient.push(c),
        }
    }
    if n_terms == 0 || !coefficient.is_empty() {
        return Err(bad());
    }
    Ok(axis)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const TWO_PANEL_GEOMETRY: &str = "\
; two panels stacked in the slab, side by side in the lab
res = 1
clen = 0.1
coffset = 0.0
adu_per_eV = 1
fs = +1.0x
ss = +1.0y

panel0/min_fs = 0
panel0/max_fs = 9
panel0/min_ss = 0
panel0/max_ss = 9
panel0/corner_x = 0
panel0/corner_y = 0

panel1/min_fs = 0
panel1/max_fs = 9
panel1/min_ss = 10
panel1/max_ss = 19
panel1/corner_x = 20 ; placed to the right
panel1/corner_y = 0
";

    #[test]
    fn test_two_panel_geometry() {
        let detector = Detector::load(TWO_PANEL_GEOMETRY).unwrap();
        assert_eq!(detector.panels().len(), 2);
        assert_eq!(detector.slab_shape(), (20, 10));
        for panel in detector.panels() {
            assert_eq!(panel.width(), panel.max_fs - panel.min_fs + 1);
            assert_eq!(panel.height(), panel.max_ss - panel.min_ss + 1);
            assert_ne!(panel.basis_determinant(), 0.0);
            assert_eq!(panel.dim_structure, vec![DimTag::SlowScan, DimTag::FastScan]);
        }
        let panel1 = detector.panel("panel1").unwrap();
        assert_eq!(panel1.corner_x, 20.0);
        assert_eq!(panel1.camera_length, CameraLength::Fixed(0.1));
        assert_eq!(panel1.adu_conversion, AduConversion::PerEv(1.0));
    }

    #[test]
    fn test_defaults_only_apply_to_later_panels() {
        let geometry = "\
p0/min_fs = 0
p0/max_fs = 1
p0/min_ss = 0
p0/max_ss = 1
p0/corner_x = 0
p0/corner_y = 0
res = 5000
clen = 0.2
adu_per_photon = 1
p1/min_fs = 0
p1/max_fs = 1
p1/min_ss = 2
p1/max_ss = 3
p1/corner_x = 0
p1/corner_y = 0
";
        match Detector::load(geometry) {
            Err(GeometryParseError::MissingKey { panel, key }) => {
                assert_eq!(panel, "p0");
                assert_eq!(key, "res");
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_axis_parsing() {
        let axis = parse_axis("fs", "+0.5x -2y").unwrap();
        assert_eq!(axis, Vector3::new(0.5, -2.0, 0.0));
        let axis = parse_axis("ss", "-x").unwrap();
        assert_eq!(axis, Vector3::new(-1.0, 0.0, 0.0));
        assert!(parse_axis("fs", "1.0").is_err());
        assert!(parse_axis("fs", "abcx").is_err());
    }

    #[test]
    fn test_singular_basis_rejected() {
        let geometry = TWO_PANEL_GEOMETRY.replace("ss = +1.0y", "ss = +2.0x");
        assert!(matches!(
            Detector::load(&geometry),
            Err(GeometryParseError::SingularBasis(_))
        ));
    }

    #[test]
    fn test_no_panels_rejected() {
        assert!(matches!(
            Detector::load("res = 100\n; nothing else\n"),
            Err(GeometryParseError::NoPanels)
        ));
    }

    #[test]
    fn test_mixed_bad_region_rejected() {
        let geometry = format!(
            "{TWO_PANEL_GEOMETRY}badbeam/min_x = -1\nbadbeam/max_x = 1\nbadbeam/min_fs = 0\n"
        );
        assert!(matches!(
            Detector::load(&geometry),
            Err(GeometryParseError::MixedBadRegion(_))
        ));
    }

    #[test]
    fn test_rigid_group_references() {
        let geometry = format!(
            "{TWO_PANEL_GEOMETRY}rigid_group_q0 = panel0,panel1\nrigid_group_collection_all = q0\n"
        );
        let detector = Detector::load(&geometry).unwrap();
        assert_eq!(detector.rigid_groups["q0"], vec!["panel0", "panel1"]);
        assert_eq!(detector.rigid_group_collections["all"], vec!["q0"]);

        let geometry = format!("{TWO_PANEL_GEOMETRY}rigid_group_q0 = panel0,panel7\n");
        assert!(matches!(
            Detector::load(&geometry),
            Err(GeometryParseError::UnknownPanel { .. })
        ));

        let geometry = format!("{TWO_PANEL_GEOMETRY}rigid_group_collection_all = q9\n");
        assert!(matches!(
            Detector::load(&geometry),
            Err(GeometryParseError::UnknownRigidGroup { .. })
        ));
    }

    #[test]
    fn test_overlapping_panels_rejected() {
        let geometry = TWO_PANEL_GEOMETRY.replace("panel1/min_ss = 10", "panel1/min_ss = 5");
        assert!(matches!(
            Detector::load(&geometry),
            Err(GeometryParseError::OverlappingPanels(_, _))
        ));
    }

    #[test]
    fn test_partial_dim_structure_rejected() {
        let geometry = format!("{TWO_PANEL_GEOMETRY}panel0/dim0 = %\npanel0/dim2 = fs\n");
        assert!(matches!(
            Detector::load(&geometry),
            Err(GeometryParseError::AmbiguousDimStructure { .. })
        ));

        // Only panel0 gets a placeholder axis
        let geometry = format!(
            "{TWO_PANEL_GEOMETRY}panel0/dim0 = %\npanel0/dim1 = ss\npanel0/dim2 = fs\n"
        );
        assert!(matches!(
            Detector::load(&geometry),
            Err(GeometryParseError::PlaceholderMismatch { .. })
        ));
    }

    #[test]
    fn test_conflicting_adu_rejected() {
        let geometry = format!("{TWO_PANEL_GEOMETRY}panel1/adu_per_photon = 2\n");
        assert!(matches!(
            Detector::load(&geometry),
            Err(GeometryParseError::ConflictingAduConversion(_))
        ));
    }

    #[test]
    fn test_malformed_lines() {
        assert!(matches!(
            Detector::load("panel0/min_fs\n"),
            Err(GeometryParseError::BadLine(1, _))
        ));
        assert!(matches!(
            Detector::load("panel0/min_fs = zero\n"),
            Err(GeometryParseError::BadNumber { .. })
        ));
        assert!(matches!(
            Detector::load("panel0/wibble = 1\n"),
            Err(GeometryParseError::UnknownKey(_))
        ));
    }

    #[test]
    fn test_mask_bits() {
        let geometry = format!("{TWO_PANEL_GEOMETRY}mask_good = 0x0000\nmask_bad = 0x2000\n");
        let detector = Detector::load(&geometry).unwrap();
        assert_eq!(detector.mask_bad, 0x2000);
        assert_eq!(detector.mask_good, 0);
    }
}
