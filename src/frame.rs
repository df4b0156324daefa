// 该文件是 Chongjian （虫鉴） 项目的一部分。
// src/frame.rs - 信箱缩放的 NCHW 模型输入帧
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

use image::{
  Rgb, RgbImage,
  imageops::{self, FilterType},
};

const RGB_CHANNELS: usize = 3;

/// 信箱填充灰度值
pub const LETTERBOX_FILL: u8 = 114;

/// 原图与正方形模型输入之间的几何关系
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
  pub scale: f32,
  pub pad_x: u32,
  pub pad_y: u32,
  pub size: u32,
  pub source_width: u32,
  pub source_height: u32,
}

impl Letterbox {
  pub fn new(source_width: u32, source_height: u32, size: u32) -> Self {
    let scale = f32::min(
      size as f32 / source_width.max(1) as f32,
      size as f32 / source_height.max(1) as f32,
    );
    let resized_width = ((source_width as f32 * scale).round() as u32).clamp(1, size);
    let resized_height = ((source_height as f32 * scale).round() as u32).clamp(1, size);

    Self {
      scale,
      pad_x: (size - resized_width) / 2,
      pad_y: (size - resized_height) / 2,
      size,
      source_width,
      source_height,
    }
  }

  pub fn resized_width(&self) -> u32 {
    ((self.source_width as f32 * self.scale).round() as u32).clamp(1, self.size)
  }

  pub fn resized_height(&self) -> u32 {
    ((self.source_height as f32 * self.scale).round() as u32).clamp(1, self.size)
  }

  /// 将模型输入坐标系下的 [x_min, y_min, x_max, y_max] 映射回原图并裁剪到图像范围
  pub fn to_source(&self, bbox: [f32; 4]) -> [f32; 4] {
    let w = self.source_width as f32;
    let h = self.source_height as f32;
    [
      ((bbox[0] - self.pad_x as f32) / self.scale).clamp(0.0, w),
      ((bbox[1] - self.pad_y as f32) / self.scale).clamp(0.0, h),
      ((bbox[2] - self.pad_x as f32) / self.scale).clamp(0.0, w),
      ((bbox[3] - self.pad_y as f32) / self.scale).clamp(0.0, h),
    ]
  }
}

/// 归一化到 [0, 1] 的 NCHW 浮点帧
#[derive(Debug, Clone)]
pub struct RgbNchwFrame {
  data: Box<[f32]>,
  letterbox: Letterbox,
}

impl RgbNchwFrame {
  /// 保持长宽比缩放到 `size × size`，空白处以灰色填充
  pub fn letterbox(image: &RgbImage, size: u32) -> Self {
    let letterbox = Letterbox::new(image.width(), image.height(), size);
    let resized = imageops::resize(
      image,
      letterbox.resized_width(),
      letterbox.resized_height(),
      FilterType::Triangle,
    );

    let mut canvas = RgbImage::from_pixel(size, size, Rgb([LETTERBOX_FILL; RGB_CHANNELS]));
    imageops::overlay(
      &mut canvas,
      &resized,
      letterbox.pad_x as i64,
      letterbox.pad_y as i64,
    );

    let plane = (size * size) as usize;
    let mut data = vec![0.0f32; RGB_CHANNELS * plane];
    for (idx, pixel) in canvas.pixels().enumerate() {
      data[idx] = pixel[0] as f32 / 255.0;
      data[plane + idx] = pixel[1] as f32 / 255.0;
      data[2 * plane + idx] = pixel[2] as f32 / 255.0;
    }

    Self {
      data: data.into_boxed_slice(),
      letterbox,
    }
  }

  pub fn shape(&self) -> [usize; 4] {
    let size = self.letterbox.size as usize;
    [1, RGB_CHANNELS, size, size]
  }

  pub fn channels(&self) -> usize {
    RGB_CHANNELS
  }

  pub fn as_nchw(&self) -> &[f32] {
    &self.data
  }

  pub fn letterbox_info(&self) -> &Letterbox {
    &self.letterbox
  }

  pub fn into_parts(self) -> ([usize; 4], Vec<f32>, Letterbox) {
    let shape = self.shape();
    (shape, self.data.into_vec(), self.letterbox)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn letterbox_pads_the_short_side() {
    let lb = Letterbox::new(1280, 640, 640);
    assert_eq!(lb.scale, 0.5);
    assert_eq!(lb.resized_width(), 640);
    assert_eq!(lb.resized_height(), 320);
    assert_eq!((lb.pad_x, lb.pad_y), (0, 160));
  }

  #[test]
  fn boxes_map_back_to_source_pixels() {
    let lb = Letterbox::new(1280, 640, 640);
    let bbox = lb.to_source([10.0, 170.0, 110.0, 270.0]);
    assert_eq!(bbox, [20.0, 20.0, 220.0, 220.0]);

    // 填充区域内的坐标被裁剪到图像边界
    let clamped = lb.to_source([-5.0, 0.0, 700.0, 640.0]);
    assert_eq!(clamped, [0.0, 0.0, 1280.0, 640.0]);
  }

  #[test]
  fn frame_is_planar_and_normalized() {
    let image = RgbImage::from_pixel(4, 2, Rgb([255, 0, 51]));
    let frame = RgbNchwFrame::letterbox(&image, 4);
    assert_eq!(frame.shape(), [1, 3, 4, 4]);

    let plane = 16;
    let data = frame.as_nchw();
    // 第一行是填充，第二行开始是原图
    let fill = LETTERBOX_FILL as f32 / 255.0;
    assert!((data[0] - fill).abs() < 1e-6);
    assert!((data[4] - 1.0).abs() < 1e-6);
    assert!(data[plane + 4].abs() < 1e-6);
    assert!((data[2 * plane + 4] - 0.2).abs() < 1e-6);
  }
}
