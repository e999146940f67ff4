use ndarray::{s, Array2, Zip};

use super::geometry::Detector;

/// Lab coordinates (in pixel units, origin at the interaction point) of every slab pixel
#[derive(Debug, Clone, PartialEq)]
pub struct PixelMaps {
    pub x: Array2<f64>,
    pub y: Array2<f64>,
    pub r: Array2<f64>,
}

impl PixelMaps {
    /// Shape (ss, fs) of the maps, identical to the detector slab
    pub fn shape(&self) -> (usize, usize) {
        self.x.dim()
    }

    pub fn slab_width(&self) -> usize {
        self.x.ncols()
    }
}

/// Slab -> visualization image index maps, along with the image shape (height, width)
#[derive(Debug, Clone, PartialEq)]
pub struct VisualizationPixelMaps {
    pub x: Array2<usize>,
    pub y: Array2<usize>,
    pub shape: (usize, usize),
}

impl VisualizationPixelMaps {
    /// Visualization (row, column) for a flat slab index, if the index is on the slab
    pub fn lookup(&self, slab_index: usize) -> Option<(usize, usize)> {
        let width = self.x.ncols();
        if width == 0 || slab_index >= self.x.len() {
            return None;
        }
        let idx = [slab_index / width, slab_index % width];
        Some((self.y[idx], self.x[idx]))
    }
}

/// Map every panel pixel to the lab with `ss*slow_axis + fs*fast_axis + corner`,
/// using panel-local fs/ss.
pub fn compute_pixel_maps(detector: &Detector) -> PixelMaps {
    let shape = detector.slab_shape();
    let mut x = Array2::<f64>::zeros(shape);
    let mut y = Array2::<f64>::zeros(shape);

    for panel in detector.panels() {
        let local_x = Array2::from_shape_fn((panel.height(), panel.width()), |(ss, fs)| {
            ss as f64 * panel.slow_axis.x + fs as f64 * panel.fast_axis.x + panel.corner_x
        });
        let local_y = Array2::from_shape_fn((panel.height(), panel.width()), |(ss, fs)| {
            ss as f64 * panel.slow_axis.y + fs as f64 * panel.fast_axis.y + panel.corner_y
        });
        x.slice_mut(s![
            panel.min_ss..=panel.max_ss,
            panel.min_fs..=panel.max_fs
        ])
        .assign(&local_x);
        y.slice_mut(s![
            panel.min_ss..=panel.max_ss,
            panel.min_fs..=panel.max_fs
        ])
        .assign(&local_y);
    }

    let mut r = Array2::<f64>::zeros(shape);
    Zip::from(&mut r)
        .and(&x)
        .and(&y)
        .for_each(|r, x, y| *r = (x * x + y * y).sqrt());

    PixelMaps { x, y, r }
}

fn max_extent(values: &Array2<f64>) -> f64 {
    let (min, max) = values
        .iter()
        .fold((0.0_f64, 0.0_f64), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
    min.abs().max(max.abs())
}

/// Smallest (height, width) image symmetric about the origin which holds every pixel.
/// The +2 keeps the extremes from being clipped.
pub fn compute_visualization_shape(maps: &PixelMaps) -> (usize, usize) {
    let height = 2 * max_extent(&maps.y).trunc() as usize + 2;
    let width = 2 * max_extent(&maps.x).trunc() as usize + 2;
    (height, width)
}

pub fn compute_visualization_pixel_maps(maps: &PixelMaps) -> VisualizationPixelMaps {
    let shape = compute_visualization_shape(maps);
    let y_shift = (shape.0 / 2) as i64 - 1;
    let x_shift = (shape.1 / 2) as i64 - 1;
    let x = maps.x.mapv(|v| (v.trunc() as i64 + x_shift) as usize);
    let y = maps.y.mapv(|v| (v.trunc() as i64 + y_shift) as usize);
    VisualizationPixelMaps { x, y, shape }
}
