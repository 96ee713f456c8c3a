use burn::tensor::{PrintOptions, set_print_options};

#[macro_export]
macro_rules! check_nan {
    ($a:expr) => {{
        use burn::tensor::cast::ToElement;
        if $a.clone().is_nan().int().sum().into_scalar().to_i32() > 0 {
            println!("A = {}", $a);
            panic!("found nan in line {}", line!());
        };
    }};
}

pub fn set_tensor_dbg_precision(prec: usize) {
    let po = PrintOptions {
        precision: Option::Some(prec),
        edge_items: 10,
        ..Default::default()
    };

    set_print_options(po);
}

/// `[2, 64, 56, 56]` as `2x64x56x56`.
pub fn fmt_shape(dims: &[usize]) -> String {
    dims.iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join("x")
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::backend::ndarray::NdArrayDevice;
    use burn::tensor::Tensor;

    #[test]
    fn test_fmt_shape() {
        assert_eq!(fmt_shape(&[2, 64, 56, 56]), "2x64x56x56");
        assert_eq!(fmt_shape(&[]), "");
    }

    #[test]
    fn test_check_nan_passes_on_finite() {
        let t = Tensor::<NdArray<f32>, 2>::ones([2, 2], &NdArrayDevice::default());
        crate::check_nan!(t);
    }

    #[test]
    #[should_panic(expected = "found nan")]
    fn test_check_nan_panics() {
        let t = Tensor::<NdArray<f32>, 1>::from_floats([1.0, f32::NAN], &NdArrayDevice::default());
        crate::check_nan!(t);
    }
}
