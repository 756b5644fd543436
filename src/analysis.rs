use crate::common::{AttendanceError, Result};
use crate::storage::FeatureSet;
use image::{DynamicImage, ImageOutputFormat, RgbImage};
use nalgebra::DMatrix;
use plotters::prelude::*;
use std::io::Cursor;

const PLOT_WIDTH: u32 = 800;
const PLOT_HEIGHT: u32 = 600;

/// Projects feature vectors onto their first two principal components.
pub fn project_2d(features: &[Vec<f32>]) -> Result<Vec<(f64, f64)>> {
    let rows = features.len();
    let dims = features.first().map(|f| f.len()).unwrap_or(0);
    if rows == 0 || dims == 0 {
        return Err(AttendanceError::ModelsMissing);
    }
    if features.iter().any(|f| f.len() != dims) {
        return Err(AttendanceError::Model("Stored features have inconsistent dimensions".into()));
    }

    let mut mean = vec![0.0f64; dims];
    for feature in features {
        for (m, &v) in mean.iter_mut().zip(feature) {
            *m += f64::from(v) / rows as f64;
        }
    }
    let centered = DMatrix::from_fn(rows, dims, |i, j| f64::from(features[i][j]) - mean[j]);

    let svd = centered.clone().svd(false, true);
    let v_t = svd.v_t
        .ok_or_else(|| AttendanceError::Model("SVD did not produce components".into()))?;

    let mut order: Vec<usize> = (0..svd.singular_values.len()).collect();
    order.sort_by(|&a, &b| svd.singular_values[b].total_cmp(&svd.singular_values[a]));

    let component = |rank: usize| order.get(rank).map(|&row| v_t.row(row).transpose());
    let first = component(0);
    let second = component(1);

    Ok((0..rows)
        .map(|i| {
            let sample = centered.row(i).transpose();
            let x = first.as_ref().map(|c| sample.dot(c)).unwrap_or(0.0);
            let y = second.as_ref().map(|c| sample.dot(c)).unwrap_or(0.0);
            (x, y)
        })
        .collect())
}

/// Scatter plot of the PCA projection, one color per identity, as PNG.
pub fn render_projection(features: &FeatureSet) -> Result<Vec<u8>> {
    if features.is_empty() {
        return Err(AttendanceError::ModelsMissing);
    }
    let points = project_2d(&features.features)?;

    let (min_x, max_x) = bounds(points.iter().map(|p| p.0));
    let (min_y, max_y) = bounds(points.iter().map(|p| p.1));

    let mut buffer = vec![0u8; (PLOT_WIDTH * PLOT_HEIGHT * 3) as usize];
    {
        let root = BitMapBackend::with_buffer(&mut buffer, (PLOT_WIDTH, PLOT_HEIGHT)).into_drawing_area();
        root.fill(&WHITE).map_err(plot_error)?;

        let mut chart = ChartBuilder::on(&root)
            .margin(30)
            .build_cartesian_2d(min_x..max_x, min_y..max_y)
            .map_err(plot_error)?;

        chart
            .draw_series(points.iter().zip(&features.labels).map(|(&(x, y), &label)| {
                Circle::new((x, y), 5, Palette99::pick(label).filled())
            }))
            .map_err(plot_error)?;

        root.present().map_err(plot_error)?;
    }

    let image = RgbImage::from_raw(PLOT_WIDTH, PLOT_HEIGHT, buffer)
        .ok_or_else(|| AttendanceError::Other(anyhow::anyhow!("Plot buffer has the wrong size")))?;
    let mut png = Vec::new();
    DynamicImage::ImageRgb8(image).write_to(&mut Cursor::new(&mut png), ImageOutputFormat::Png)?;
    Ok(png)
}

/// Padded range covering every value; never empty.
fn bounds(values: impl Iterator<Item = f64>) -> (f64, f64) {
    let (min, max) = values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
    if !min.is_finite() || !max.is_finite() {
        return (-1.0, 1.0);
    }
    let pad = ((max - min) * 0.1).max(1e-3);
    (min - pad, max + pad)
}

fn plot_error<E: std::fmt::Debug>(e: E) -> AttendanceError {
    AttendanceError::Other(anyhow::anyhow!("Plot rendering failed: {:?}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn projection_separates_clusters_along_first_axis() {
        let features = vec![
            vec![1.0, 0.0, 0.0],
            vec![1.1, 0.0, 0.05],
            vec![-1.0, 0.0, 0.0],
            vec![-1.1, 0.05, 0.0],
        ];
        let points = project_2d(&features).unwrap();
        assert_eq!(points.len(), 4);
        assert!(points[0].0.signum() == points[1].0.signum());
        assert!(points[0].0.signum() != points[2].0.signum());
        assert!(points[0].0.abs() > 10.0 * points[0].1.abs());
    }

    #[test]
    fn single_sample_projects_to_origin() {
        let points = project_2d(&[vec![0.3, 0.4]]).unwrap();
        assert!(points[0].0.abs() < 1e-9 && points[0].1.abs() < 1e-9);
    }

    #[test]
    fn renders_png() {
        let features = FeatureSet {
            features: vec![vec![0.0, 1.0], vec![1.0, 0.0], vec![0.9, 0.1]],
            labels: vec![0, 1, 1],
            names: vec!["alice".into(), "bob".into()],
        };
        let png = render_projection(&features).unwrap();
        assert_eq!(&png[..4], &[0x89, b'P', b'N', b'G']);
    }

    #[test]
    fn empty_features_are_missing_models() {
        assert!(matches!(
            render_projection(&FeatureSet::default()),
            Err(AttendanceError::ModelsMissing)
        ));
    }
}
