//! Exponential moving average teacher
//!
//! The teacher is a copy of the student on the inner (non-autodiff) backend,
//! so it never takes part in a backward pass and its batch-norm layers always
//! run in evaluation mode. Parameters and running statistics are matched by
//! parameter id and blended with
//!
//! ```text
//! decay   = min(1 - 1 / (step + 1), alpha)
//! teacher = decay * teacher + (1 - decay) * student
//! ```

use std::collections::HashMap;
use std::marker::PhantomData;

use burn::module::{AutodiffModule, Module, ModuleMapper, ModuleVisitor, ParamId};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;
use tracing::trace;

use crate::model::Segmenter;

/// Warm-up decay schedule; 0 at step 0, rising toward `alpha`
pub fn ema_decay(step: usize, alpha: f64) -> f64 {
    (1.0 - 1.0 / (step as f64 + 1.0)).min(alpha)
}

/// Collects every float tensor of a module, flattened, keyed by id
struct FlatCollector<B: Backend> {
    tensors: HashMap<ParamId, Tensor<B, 1>>,
}

impl<B: Backend> ModuleVisitor<B> for FlatCollector<B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, tensor: &Tensor<B, D>) {
        let len: usize = tensor.dims().iter().product();
        self.tensors.insert(id, tensor.clone().reshape([len]));
    }
}

/// Blends each tensor toward its counterpart in `source`
struct EmaMapper<B: Backend> {
    source: HashMap<ParamId, Tensor<B, 1>>,
    decay: f64,
    missing: usize,
    _backend: PhantomData<B>,
}

impl<B: Backend> ModuleMapper<B> for EmaMapper<B> {
    fn map_float<const D: usize>(&mut self, id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        match self.source.remove(&id) {
            Some(student) => {
                let student: Tensor<B, D> = student.reshape(tensor.dims());
                if self.decay == 0.0 {
                    student
                } else {
                    tensor.mul_scalar(self.decay) + student.mul_scalar(1.0 - self.decay)
                }
            }
            None => {
                self.missing += 1;
                tensor
            }
        }
    }
}

/// Shadow copy of the student updated by exponential moving average
#[derive(Debug)]
pub struct EmaTeacher<B: AutodiffBackend> {
    model: Segmenter<B::InnerBackend>,
    alpha: f64,
    step: usize,
}

impl<B: AutodiffBackend> EmaTeacher<B> {
    /// Start from an exact copy of the student
    pub fn new(student: &Segmenter<B>, alpha: f64) -> Self {
        Self {
            model: student.valid(),
            alpha,
            step: 0,
        }
    }

    /// The teacher network (evaluation mode)
    pub fn model(&self) -> &Segmenter<B::InnerBackend> {
        &self.model
    }

    /// Number of updates applied so far
    pub fn step(&self) -> usize {
        self.step
    }

    /// Decay the next `update` will use
    pub fn current_decay(&self) -> f64 {
        ema_decay(self.step, self.alpha)
    }

    /// Blend the student's current parameters into the teacher and advance
    /// the step counter. Returns the decay that was applied.
    pub fn update(&mut self, student: &Segmenter<B>) -> f64 {
        let decay = self.current_decay();

        let mut collector = FlatCollector::<B::InnerBackend> {
            tensors: HashMap::new(),
        };
        student.valid().visit(&mut collector);

        let mut mapper = EmaMapper {
            source: collector.tensors,
            decay,
            missing: 0,
            _backend: PhantomData,
        };
        self.model = self.model.clone().map(&mut mapper);

        if mapper.missing > 0 {
            trace!("{} teacher tensors had no student counterpart", mapper.missing);
        }

        self.step += 1;
        decay
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::SegmenterConfig;
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;

    type TestBackend = Autodiff<NdArray>;

    pub(crate) fn flat_params<B: Backend>(model: &Segmenter<B>) -> Vec<(ParamId, Vec<f32>)> {
        let mut collector = FlatCollector::<B> {
            tensors: HashMap::new(),
        };
        model.visit(&mut collector);
        let mut out: Vec<_> = collector
            .tensors
            .into_iter()
            .map(|(id, t)| (id, t.into_data().convert::<f32>().to_vec::<f32>().unwrap()))
            .collect();
        out.sort_by_key(|(id, _)| format!("{:?}", id));
        out
    }

    #[test]
    fn test_decay_schedule() {
        let alpha = 0.99;
        assert_eq!(ema_decay(0, alpha), 0.0);
        assert!((ema_decay(1, alpha) - 0.5).abs() < 1e-12);

        let mut previous = -1.0;
        for step in 0..1000 {
            let decay = ema_decay(step, alpha);
            assert!(decay >= previous);
            assert!(decay <= alpha);
            previous = decay;
        }
        assert_eq!(ema_decay(10_000, alpha), alpha);
    }

    #[test]
    fn test_first_update_copies_student() {
        let device = Default::default();
        let config = SegmenterConfig::new().with_num_classes(2).with_base_filters(2);
        let student: Segmenter<TestBackend> = config.init(&device);

        let mut teacher = EmaTeacher::new(&student, 0.99);
        assert_eq!(flat_params(teacher.model()), flat_params(&student.valid()));

        // Move the teacher away so the copy is observable
        teacher.model = teacher.model.clone().map(&mut ShiftMapper);
        assert_ne!(flat_params(teacher.model()), flat_params(&student.valid()));

        let decay = teacher.update(&student);
        assert_eq!(decay, 0.0);
        assert_eq!(teacher.step(), 1);
        assert_eq!(flat_params(teacher.model()), flat_params(&student.valid()));
    }

    #[test]
    fn test_second_update_is_halfway() {
        let device = Default::default();
        let config = SegmenterConfig::new().with_num_classes(2).with_base_filters(2);
        let student: Segmenter<TestBackend> = config.init(&device);

        let mut teacher = EmaTeacher::new(&student, 0.99);
        teacher.update(&student);
        let before = flat_params(teacher.model());

        // Shift every student tensor by +2
        let shifted = student.clone().map(&mut ShiftMapper);
        let decay = teacher.update(&shifted);
        assert!((decay - 0.5).abs() < 1e-12);

        for ((id_a, a), (id_b, b)) in before.iter().zip(flat_params(teacher.model())) {
            assert_eq!(*id_a, id_b);
            for (x, y) in a.iter().zip(b.iter()) {
                assert!((y - (x + 1.0)).abs() < 1e-5);
            }
        }
    }

    struct ShiftMapper;

    impl<B: Backend> ModuleMapper<B> for ShiftMapper {
        fn map_float<const D: usize>(&mut self, _id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
            tensor.add_scalar(2.0)
        }
    }
}
