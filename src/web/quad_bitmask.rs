use nalgebra::Point2;
use wasm_bindgen::prelude::{wasm_bindgen, JsValue};

use crate::quad_helper::QuadBitmask as QuadBitmaskInner;

fn to_js(e: crate::BitmaskError) -> JsValue {
    JsValue::from_str(&e.to_string())
}

#[wasm_bindgen]
pub struct QuadBitmask(QuadBitmaskInner<i32>);

#[wasm_bindgen]
impl QuadBitmask {
    /// 叶子大小，x至少为8，都必须是2的幂
    pub fn new(x: u32, y: u32) -> Result<QuadBitmask, JsValue> {
        QuadBitmaskInner::new([x as usize, y as usize])
            .map(Self)
            .map_err(to_js)
    }

    pub fn get(&self, x: i32, y: i32) -> bool {
        self.0.get(&Point2::new(x, y))
    }

    pub fn set(&self, x: i32, y: i32, value: bool) -> Result<bool, JsValue> {
        self.0.set(&Point2::new(x, y), value).map_err(to_js)
    }

    pub fn clear(&self) {
        self.0.clear();
    }

    /// 为true的位置数量
    pub fn size(&self) -> f64 {
        self.0.tree().size() as f64
    }

    /// [minx, miny, maxx, maxy]，全false时为空
    pub fn bbox(&self) -> Vec<i32> {
        match self.0.tree().bbox() {
            Some(b) => vec![b.mins.x, b.mins.y, b.maxs.x, b.maxs.y],
            None => vec![],
        }
    }
}
