// 该文件是 Chongjian （虫鉴） 项目的一部分。
// src/output/draw.rs - 目标检测结果可视化
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

use ab_glyph::{FontRef, PxScale};
use image::{Rgb, RgbImage};
use imageproc::{
  drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut},
  rect::Rect,
};

use crate::model::{DetectItem, DetectResult};

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 20.0;
const LABEL_TEXT_HEIGHT: i32 = 24;
const LABEL_CHAR_WIDTH: f32 = 11.0; // 每字符平均宽度（粗略估计）
const LABEL_TEXT_VERTICAL_PADDING: i32 = 2;
const LABEL_TEXT_COLOR: [u8; 3] = [255, 255, 255];

// 任一边长达到该值时使用粗线
const THICK_LINE_MIN_SIDE: u32 = 500;
const THICK_LINE_WIDTH: i32 = 3;
const THIN_LINE_WIDTH: i32 = 1;

const PALETTE_SIZE: usize = 16;

pub struct Draw<'a> {
  font_size: f32,
  label_text_height: i32,
  label_char_width: f32,
  label_text_vertical_padding: i32,
  font: FontRef<'a>,
  colors: Vec<Rgb<u8>>,
}

impl<'a> Default for Draw<'a> {
  fn default() -> Self {
    let font_data = include_bytes!("../../assets/DejaVuSans.ttf");
    let font = FontRef::try_from_slice(font_data).expect("无法加载嵌入的字体文件");

    // 色相环上均匀取色，每个类别一种颜色
    let colors = (0..PALETTE_SIZE)
      .map(|i| hsv_to_rgb((i as f32 / PALETTE_SIZE as f32) * 360.0, 0.8, 0.9))
      .collect();

    Self {
      font_size: LABEL_FONT_SIZE,
      label_text_height: LABEL_TEXT_HEIGHT,
      label_char_width: LABEL_CHAR_WIDTH,
      label_text_vertical_padding: LABEL_TEXT_VERTICAL_PADDING,
      font,
      colors,
    }
  }
}

/// HSV 转 RGB
pub(crate) fn hsv_to_rgb(h: f32, s: f32, v: f32) -> Rgb<u8> {
  let c = v * s;
  let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
  let m = v - c;

  let (r, g, b) = if h < 60.0 {
    (c, x, 0.0)
  } else if h < 120.0 {
    (x, c, 0.0)
  } else if h < 180.0 {
    (0.0, c, x)
  } else if h < 240.0 {
    (0.0, x, c)
  } else if h < 300.0 {
    (x, 0.0, c)
  } else {
    (c, 0.0, x)
  };

  Rgb([
    ((r + m) * 255.0) as u8,
    ((g + m) * 255.0) as u8,
    ((b + m) * 255.0) as u8,
  ])
}

/// 按图像尺寸决定边框线宽
pub fn line_width_for(width: u32, height: u32) -> i32 {
  if width >= THICK_LINE_MIN_SIDE || height >= THICK_LINE_MIN_SIDE {
    THICK_LINE_WIDTH
  } else {
    THIN_LINE_WIDTH
  }
}

impl<'a> Draw<'a> {
  pub fn color_of(&self, class_id: u32) -> Rgb<u8> {
    self.colors[class_id as usize % self.colors.len()]
  }

  /// 在图像副本上绘制检测框；`draw_boxes` 为假时原样返回副本，标签随之忽略
  pub fn annotate(
    &self,
    image: &RgbImage,
    result: &DetectResult,
    draw_boxes: bool,
    draw_labels: bool,
  ) -> RgbImage {
    let mut canvas = image.clone();
    if !draw_boxes {
      return canvas;
    }

    let line_width = line_width_for(canvas.width(), canvas.height());
    for item in result.items.iter() {
      let label = draw_labels.then(|| format!("{} {:.2}", result.names.resolve(item.class_id), item.score));
      self.draw_item(&mut canvas, item, line_width, label.as_deref());
    }
    canvas
  }

  /// 绘制一组边框（不带标签），用于热力图叠加
  pub fn draw_boxes(&self, image: &mut RgbImage, items: &[DetectItem]) {
    let line_width = line_width_for(image.width(), image.height());
    for item in items {
      self.draw_item(image, item, line_width, None);
    }
  }

  // bbox 为原图像素坐标 [x_min, y_min, x_max, y_max]
  fn draw_item(&self, image: &mut RgbImage, item: &DetectItem, line_width: i32, label: Option<&str>) {
    let (w, h) = (image.width() as i32, image.height() as i32);
    if w == 0 || h == 0 {
      return;
    }

    let x_min = (item.bbox[0].floor() as i32).clamp(0, w - 1);
    let y_min = (item.bbox[1].floor() as i32).clamp(0, h - 1);
    let x_max = (item.bbox[2].ceil() as i32).clamp(0, w - 1);
    let y_max = (item.bbox[3].ceil() as i32).clamp(0, h - 1);

    if x_min >= x_max || y_min >= y_max {
      return;
    }

    let color = self.color_of(item.class_id);

    // 由外向内逐层绘制以加粗边框
    for t in 0..line_width {
      let width = x_max - x_min + 1 - 2 * t;
      let height = y_max - y_min + 1 - 2 * t;
      if width <= 0 || height <= 0 {
        break;
      }
      let rect = Rect::at(x_min + t, y_min + t).of_size(width as u32, height as u32);
      draw_hollow_rect_mut(image, rect, color);
    }

    let Some(label) = label else {
      return;
    };

    // 估算文本大小（粗略估计）
    let text_width = (label.chars().count() as f32 * self.label_char_width) as i32;
    let text_height = self.label_text_height;

    // 标签背景位于边框上方，空间不足时贴住图像顶部
    let label_x = x_min;
    let label_y = (y_min - text_height).max(0);
    let label_width = text_width.min(w - label_x).max(0) as u32;

    if label_width > 0 {
      let rect = Rect::at(label_x, label_y).of_size(label_width, text_height as u32);
      draw_filled_rect_mut(image, rect, color);
      draw_text_mut(
        image,
        Rgb(LABEL_TEXT_COLOR),
        label_x,
        label_y + self.label_text_vertical_padding,
        PxScale::from(self.font_size),
        &self.font,
        label,
      );
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use super::*;
  use crate::model::ClassNames;

  fn result(items: Vec<DetectItem>) -> DetectResult {
    DetectResult {
      items: items.into_boxed_slice(),
      names: Arc::new(ClassNames::parasite()),
    }
  }

  fn item(bbox: [f32; 4]) -> DetectItem {
    DetectItem {
      class_id: 2,
      score: 0.9,
      bbox,
    }
  }

  #[test]
  fn line_width_depends_on_image_size() {
    assert_eq!(line_width_for(499, 499), 1);
    assert_eq!(line_width_for(500, 10), 3);
    assert_eq!(line_width_for(10, 640), 3);
  }

  #[test]
  fn annotate_without_boxes_returns_an_identical_copy() {
    let image = RgbImage::from_pixel(64, 64, Rgb([10, 20, 30]));
    let draw = Draw::default();
    let out = draw.annotate(&image, &result(vec![item([5.0, 5.0, 40.0, 40.0])]), false, true);
    assert_eq!(out, image);
  }

  #[test]
  fn annotate_draws_box_outline_in_class_colour() {
    let image = RgbImage::from_pixel(64, 64, Rgb([0, 0, 0]));
    let draw = Draw::default();
    let out = draw.annotate(&image, &result(vec![item([10.0, 30.0, 50.0, 60.0])]), true, false);

    let color = draw.color_of(2);
    assert_eq!(*out.get_pixel(10, 45), color);
    assert_eq!(*out.get_pixel(30, 60), color);
    // 细线模式下内部不着色
    assert_eq!(*out.get_pixel(12, 45), Rgb([0, 0, 0]));
    // 原图不被修改
    assert_eq!(*image.get_pixel(10, 45), Rgb([0, 0, 0]));
  }

  #[test]
  fn thick_lines_on_large_images() {
    let image = RgbImage::from_pixel(600, 100, Rgb([0, 0, 0]));
    let draw = Draw::default();
    let out = draw.annotate(&image, &result(vec![item([100.0, 40.0, 300.0, 90.0])]), true, false);
    let color = draw.color_of(2);
    assert_eq!(*out.get_pixel(100, 60), color);
    assert_eq!(*out.get_pixel(102, 60), color);
    assert_eq!(*out.get_pixel(103, 60), Rgb([0, 0, 0]));
  }

  #[test]
  fn labels_are_drawn_above_the_box() {
    let image = RgbImage::from_pixel(200, 200, Rgb([0, 0, 0]));
    let draw = Draw::default();
    let with = draw.annotate(&image, &result(vec![item([50.0, 100.0, 150.0, 150.0])]), true, true);
    let without = draw.annotate(&image, &result(vec![item([50.0, 100.0, 150.0, 150.0])]), true, false);
    assert_ne!(with, without);
    // 标签背景从 y_min - 24 开始
    assert_eq!(*with.get_pixel(51, 77), draw.color_of(2));
  }

  #[test]
  fn degenerate_boxes_are_skipped() {
    let image = RgbImage::from_pixel(32, 32, Rgb([0, 0, 0]));
    let draw = Draw::default();
    let out = draw.annotate(&image, &result(vec![item([10.0, 10.0, 10.0, 20.0])]), true, true);
    assert_eq!(out, image);
  }
}
