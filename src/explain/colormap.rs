// 该文件是 Chongjian （虫鉴） 项目的一部分。
// src/explain/colormap.rs - 显著性图的缩放与伪彩色叠加
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use image::{Rgb, RgbImage};
use ndarray::{Array2, ArrayView2, s};

use crate::{frame::Letterbox, model::DetectItem};

/// 热力图与原图的混合比例
pub const HEATMAP_ALPHA: f32 = 0.5;

const SCALE_EPS: f32 = 1e-7;

/// jet 伪彩色，输入取值 [0, 1]，低值为蓝，高值为红
pub fn jet(value: f32) -> Rgb<u8> {
  let v = value.clamp(0.0, 1.0);
  let channel = |offset: f32| ((1.5 - (4.0 * v - offset).abs()).clamp(0.0, 1.0) * 255.0).round() as u8;
  Rgb([channel(3.0), channel(2.0), channel(1.0)])
}

/// 原地线性缩放到 [0, 1]，常数图置零
pub fn scale_min_max(map: &mut Array2<f32>) {
  let (min, max) = map
    .iter()
    .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
  if !min.is_finite() || max - min < SCALE_EPS {
    map.fill(0.0);
    return;
  }
  map.mapv_inplace(|v| (v - min) / (max - min));
}

/// 双线性采样，坐标以像素中心为准
fn sample_bilinear(map: &ArrayView2<f32>, fx: f32, fy: f32) -> f32 {
  let (h, w) = map.dim();
  let fx = fx.clamp(0.0, (w - 1) as f32);
  let fy = fy.clamp(0.0, (h - 1) as f32);
  let x0 = fx.floor() as usize;
  let y0 = fy.floor() as usize;
  let x1 = (x0 + 1).min(w - 1);
  let y1 = (y0 + 1).min(h - 1);
  let tx = fx - x0 as f32;
  let ty = fy - y0 as f32;

  let top = map[[y0, x0]] * (1.0 - tx) + map[[y0, x1]] * tx;
  let bottom = map[[y1, x0]] * (1.0 - tx) + map[[y1, x1]] * tx;
  top * (1.0 - ty) + bottom * ty
}

/// 将模型输入坐标系（信箱缩放后）上的特征图重采样到原图尺寸
pub fn resample_to_source(map: &ArrayView2<f32>, letterbox: &Letterbox) -> Array2<f32> {
  let (fh, fw) = map.dim();
  let (sw, sh) = (letterbox.source_width as usize, letterbox.source_height as usize);
  if fh == 0 || fw == 0 {
    return Array2::zeros((sh, sw));
  }
  let stride_x = fw as f32 / letterbox.size as f32;
  let stride_y = fh as f32 / letterbox.size as f32;

  Array2::from_shape_fn((sh, sw), |(y, x)| {
    let lx = (x as f32 + 0.5) * letterbox.scale + letterbox.pad_x as f32;
    let ly = (y as f32 + 0.5) * letterbox.scale + letterbox.pad_y as f32;
    sample_bilinear(map, lx * stride_x - 0.5, ly * stride_y - 0.5)
  })
}

/// 只保留检测框内的响应，每个框内单独缩放到 [0, 1]，最后整体再缩放一次
pub fn renormalize_in_boxes(map: &Array2<f32>, items: &[DetectItem]) -> Array2<f32> {
  let (h, w) = map.dim();
  let mut out = Array2::<f32>::zeros((h, w));

  for item in items {
    let x0 = (item.bbox[0].floor().max(0.0) as usize).min(w);
    let y0 = (item.bbox[1].floor().max(0.0) as usize).min(h);
    let x1 = (item.bbox[2].ceil().max(0.0) as usize).min(w);
    let y1 = (item.bbox[3].ceil().max(0.0) as usize).min(h);
    if x0 >= x1 || y0 >= y1 {
      continue;
    }

    let mut region = map.slice(s![y0..y1, x0..x1]).to_owned();
    scale_min_max(&mut region);
    out
      .slice_mut(s![y0..y1, x0..x1])
      .zip_mut_with(&region, |dst, &src| *dst = dst.max(src));
  }

  scale_min_max(&mut out);
  out
}

/// 将 [0, 1] 的显著性图以 jet 伪彩色按比例叠加到原图
pub fn overlay(image: &RgbImage, map: &ArrayView2<f32>, alpha: f32) -> RgbImage {
  let mut out = image.clone();
  for (x, y, pixel) in out.enumerate_pixels_mut() {
    let heat = jet(map[[y as usize, x as usize]]);
    for c in 0..3 {
      let blended = alpha * heat[c] as f32 + (1.0 - alpha) * pixel[c] as f32;
      pixel[c] = blended.round().clamp(0.0, 255.0) as u8;
    }
  }
  out
}

#[cfg(test)]
mod tests {
  use ndarray::array;

  use super::*;

  #[test]
  fn jet_endpoints() {
    assert_eq!(jet(0.0), Rgb([0, 0, 128]));
    assert_eq!(jet(0.5), Rgb([128, 255, 128]));
    assert_eq!(jet(1.0), Rgb([128, 0, 0]));
    assert_eq!(jet(2.0), jet(1.0));
  }

  #[test]
  fn min_max_scaling() {
    let mut map = array![[2.0, 4.0], [6.0, 10.0]];
    scale_min_max(&mut map);
    assert_eq!(map, array![[0.0, 0.25], [0.5, 1.0]]);

    let mut flat = array![[3.0, 3.0]];
    scale_min_max(&mut flat);
    assert_eq!(flat, array![[0.0, 0.0]]);
  }

  #[test]
  fn resampling_preserves_a_constant_map_and_source_size() {
    let map = Array2::from_elem((20, 20), 0.7f32);
    let letterbox = Letterbox::new(64, 32, 640);
    let out = resample_to_source(&map.view(), &letterbox);
    assert_eq!(out.dim(), (32, 64));
    assert!(out.iter().all(|&v| (v - 0.7).abs() < 1e-6));
  }

  #[test]
  fn resampling_ignores_the_padding() {
    // 上下各 160 像素为填充，特征图只有中间一半为热点
    let letterbox = Letterbox::new(1280, 640, 640);
    let mut map = Array2::<f32>::zeros((20, 20));
    map.slice_mut(s![5..15, ..]).fill(1.0);
    let out = resample_to_source(&map.view(), &letterbox);
    assert!((out[[320, 640]] - 1.0).abs() < 1e-6);
    assert!((out[[40, 10]] - 1.0).abs() < 1e-6);
  }

  #[test]
  fn renormalization_zeroes_outside_boxes() {
    let map = Array2::from_shape_fn((10, 10), |(y, x)| (y * 10 + x) as f32);
    let items = [DetectItem {
      class_id: 0,
      score: 0.9,
      bbox: [2.0, 2.0, 5.0, 5.0],
    }];
    let out = renormalize_in_boxes(&map, &items);
    assert_eq!(out[[0, 0]], 0.0);
    assert_eq!(out[[9, 9]], 0.0);
    assert_eq!(out[[2, 2]], 0.0);
    assert_eq!(out[[4, 4]], 1.0);
  }

  #[test]
  fn overlay_blends_half_and_half() {
    let image = RgbImage::from_pixel(2, 1, Rgb([0, 0, 0]));
    let map = array![[1.0f32, 0.0]];
    let out = overlay(&image, &map.view(), HEATMAP_ALPHA);
    assert_eq!(*out.get_pixel(0, 0), Rgb([64, 0, 0]));
    assert_eq!(*out.get_pixel(1, 0), Rgb([0, 0, 64]));
  }
}
