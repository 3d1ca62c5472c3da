//! End-to-end tests of the fusion engine and ELBO decomposer with toy adapters.

use std::collections::BTreeSet;

use candle_core::{Device, Tensor};
use candle_nn::{Optimizer, SGD};
use mmvae_core::distribution::Distr;
use mmvae_core::{
    run_epoch, train_step, BatchResults, ElboDecomposer, EncMod, ExperimentConfig, FusionError,
    FusionMethod, FusionResult, LatentSource, Likelihood, ModalityAdapter, ModalityBatch,
    MultimodalVae, Reconstruction, SubsetKey,
};
use mmvae_test_utils::{synthetic_batch, ConstantAdapter, FailingAdapter, LinearGaussianAdapter};
use rand::rngs::StdRng;
use rand::SeedableRng;

const LATENT_DIM: usize = 8;

fn config(method: FusionMethod) -> ExperimentConfig {
    let mut config = ExperimentConfig {
        method,
        latent_dim: LATENT_DIM,
        batch_size: 4,
        ..ExperimentConfig::default()
    };
    config.flow.num_flows = 2;
    config.flow.hidden_dim = 8;
    config
}

fn linear_vae(method: FusionMethod, names: &[&str]) -> MultimodalVae {
    let adapters: Vec<Box<dyn ModalityAdapter>> = names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            Box::new(LinearGaussianAdapter::new(name, 6, LATENT_DIM, 100 + i as u64))
                as Box<dyn ModalityAdapter>
        })
        .collect();
    MultimodalVae::new(config(method), adapters, Device::Cpu).expect("vae construction")
}

fn batch_for(names: &[&str], batch_size: usize) -> ModalityBatch {
    let dims: Vec<(&str, usize)> = names.iter().map(|n| (*n, 6)).collect();
    synthetic_batch(&dims, batch_size, 7)
}

fn source_labels(vae: &MultimodalVae, batch: &ModalityBatch) -> Vec<(String, Vec<String>)> {
    let mut rng = StdRng::seed_from_u64(0);
    let forward = vae.forward(batch, &mut rng).expect("forward pass");
    forward
        .reconstructions
        .iter()
        .map(|(source, targets)| (source.to_string(), targets.keys().cloned().collect()))
        .collect()
}

#[test]
fn joint_elbo_two_modalities_end_to_end() {
    let adapters: Vec<Box<dyn ModalityAdapter>> = vec![
        Box::new(ConstantAdapter::new("a", 5, LATENT_DIM)),
        Box::new(ConstantAdapter::new("b", 3, LATENT_DIM)),
    ];
    let vae = MultimodalVae::new(config(FusionMethod::JointElbo), adapters, Device::Cpu).unwrap();
    let decomposer = ElboDecomposer::new(&vae);
    let batch = synthetic_batch(&[("a", 5), ("b", 3)], 4, 1);

    let mut rng = StdRng::seed_from_u64(42);
    let forward = vae.forward(&batch, &mut rng).unwrap();

    let keys: Vec<&str> = forward.joint_latents.keys().map(SubsetKey::as_str).collect();
    println!("STATE: joint latent keys = {:?}", keys);
    assert_eq!(keys, vec!["", "a", "a_b", "b"]);
    assert!(forward.joint_latents.subset(&SubsetKey::empty()).is_none());

    let fused: Vec<&str> = forward.joint_latents.fused().map(|(k, _)| k.as_str()).collect();
    assert_eq!(fused, vec!["a", "a_b", "b"]);
    for (key, embedding) in forward.joint_latents.fused() {
        assert_eq!(embedding.gaussian().mu().dims(), &[4, LATENT_DIM], "subset {}", key);
        assert_eq!(embedding.gaussian().logvar().dims(), &[4, LATENT_DIM], "subset {}", key);
    }

    let results = decomposer.compute(forward, &batch, 0).unwrap();
    let loss = results.total_loss_value().unwrap();
    println!("STATE: total loss = {}", loss);
    assert!(loss.is_finite(), "total loss must be finite, got {}", loss);
    assert_eq!(results.total_loss.dims(), &[] as &[usize]);
    assert_eq!(
        results.klds.keys().map(String::as_str).collect::<Vec<_>>(),
        vec!["a", "a_b", "b"]
    );
}

#[test]
fn every_method_produces_a_finite_loss() {
    for method in FusionMethod::ALL {
        let vae = linear_vae(method, &["img", "text", "label"]);
        let decomposer = ElboDecomposer::new(&vae);
        let batch = batch_for(&["img", "text", "label"], 5);
        let mut rng = StdRng::seed_from_u64(3);

        let forward = vae.forward(&batch, &mut rng).unwrap();
        let results = decomposer.compute(forward, &batch, 2).unwrap();
        let loss = results.total_loss_value().unwrap();
        println!("STATE: method={} loss={} joint_div={}", method, loss, results.joint_divergence);
        assert!(loss.is_finite(), "method {} gave loss {}", method, loss);
        assert!(results.joint_divergence.is_finite());
        assert_eq!(results.klds.len(), 7, "method {} should fuse all 7 subsets", method);
    }
}

const BETA: f64 = 2.5;
const BETA_CONTENT: f64 = 0.7;
const BETA_STYLE: f64 = 0.3;

/// Two modalities, `b` weighted 2.0, fixed beta, optional style heads.
fn weighted_vae(method: FusionMethod, style_dim: usize) -> MultimodalVae {
    let mut config = config(method);
    config.beta.max_beta = BETA;
    config.beta.warmup_epochs = 0;
    config.beta.beta_content = BETA_CONTENT;
    config.beta.beta_style = BETA_STYLE;
    config.reconstruction_weights.insert("b".into(), 2.0);
    config.factorized_representation = style_dim > 0;
    config.style_dim = style_dim;
    let adapters: Vec<Box<dyn ModalityAdapter>> = vec![
        Box::new(LinearGaussianAdapter::with_style("a", 6, LATENT_DIM, style_dim, 21)),
        Box::new(LinearGaussianAdapter::with_style("b", 6, LATENT_DIM, style_dim, 22)),
    ];
    MultimodalVae::new(config, adapters, Device::Cpu).expect("vae construction")
}

fn style_sum<'a>(results: &BatchResults, targets: impl Iterator<Item = &'a String>) -> f64 {
    targets
        .filter_map(|t| results.style_klds.get(t))
        .map(|v| *v as f64)
        .sum()
}

/// Rebuild the objective from the reported terms.
fn expected_total(method: FusionMethod, results: &BatchResults, decomposer: &ElboDecomposer) -> f64 {
    let beta = results.beta;
    let nll = |source: &str| -> f64 {
        results.log_probs[source]
            .iter()
            .map(|(target, lp)| -decomposer.reconstruction_weight(target) * *lp as f64)
            .sum()
    };
    let all_style = style_sum(results, results.style_klds.keys());

    match method {
        FusionMethod::Poe => results
            .log_probs
            .iter()
            .map(|(source, targets)| {
                let kl = results.klds[source] as f64;
                let style = style_sum(results, targets.keys());
                nll(source.as_str()) + beta * (BETA_CONTENT * kl + BETA_STYLE * style)
            })
            .sum(),
        FusionMethod::JointElbo => {
            let pi = 1.0 / results.log_probs.len() as f64;
            let rec: f64 = results.log_probs.keys().map(|s| pi * nll(s.as_str())).sum();
            let kl: f64 = results.log_probs.keys().map(|s| pi * results.klds[s] as f64).sum();
            rec + beta * (BETA_CONTENT * kl + BETA_STYLE * all_style)
        }
        FusionMethod::Jsd => {
            nll("joint") + beta * (BETA_CONTENT * results.joint_divergence as f64 + BETA_STYLE * all_style)
        }
        other => panic!("no reference formula for {}", other),
    }
}

#[test]
fn total_loss_matches_the_method_formula() {
    let batch = batch_for(&["a", "b"], 5);
    for style_dim in [0, 3] {
        for method in [FusionMethod::Poe, FusionMethod::JointElbo, FusionMethod::Jsd] {
            let vae = weighted_vae(method, style_dim);
            let decomposer = ElboDecomposer::new(&vae);
            assert_eq!(decomposer.reconstruction_weight("b"), 2.0);
            let mut rng = StdRng::seed_from_u64(17);

            let forward = vae.forward(&batch, &mut rng).unwrap();
            let results = decomposer.compute(forward, &batch, 4).unwrap();
            assert_eq!(results.beta, BETA);
            assert_eq!(results.style_klds.len(), if style_dim > 0 { 2 } else { 0 });

            let got = results.total_loss_value().unwrap() as f64;
            let expected = expected_total(method, &results, &decomposer);
            println!("STATE: method={} style_dim={} got={} expected={}", method, style_dim, got, expected);
            let tol = 1e-4 * expected.abs().max(1.0);
            assert!(
                (got - expected).abs() < tol,
                "method {} style_dim {}: total {} but terms give {}",
                method,
                style_dim,
                got,
                expected
            );
        }
    }
}

#[test]
fn jsd_reconstructs_only_from_the_joint() {
    let vae = weighted_vae(FusionMethod::Jsd, 0);
    let batch = batch_for(&["a", "b"], 3);
    let mut rng = StdRng::seed_from_u64(2);
    let results = ElboDecomposer::new(&vae)
        .compute(vae.forward(&batch, &mut rng).unwrap(), &batch, 0)
        .unwrap();
    assert_eq!(results.log_probs.keys().map(String::as_str).collect::<Vec<_>>(), vec!["joint"]);
    assert!(results.joint_divergence >= 0.0);
}

#[test]
fn factorized_representation_adds_style_terms() {
    let mut config = config(FusionMethod::Moe);
    config.factorized_representation = true;
    config.style_dim = 3;
    let adapters: Vec<Box<dyn ModalityAdapter>> = vec![
        Box::new(LinearGaussianAdapter::with_style("a", 6, LATENT_DIM, 3, 1)),
        Box::new(LinearGaussianAdapter::with_style("b", 6, LATENT_DIM, 3, 2)),
    ];
    let vae = MultimodalVae::new(config, adapters, Device::Cpu).unwrap();
    let decomposer = ElboDecomposer::new(&vae);
    let batch = batch_for(&["a", "b"], 4);
    let mut rng = StdRng::seed_from_u64(5);

    let results = decomposer
        .compute(vae.forward(&batch, &mut rng).unwrap(), &batch, 0)
        .unwrap();
    assert_eq!(results.style_klds.len(), 2);
    assert!(results.style_klds.values().all(|v| v.is_finite() && *v >= 0.0));
    // Style never enters subset fusion.
    assert!(!results.klds.contains_key("a_b_style"));
    assert_eq!(results.klds.len(), 3);

    let summary = results.summary().unwrap();
    assert_eq!(summary.style_latents.len(), 2);
}

#[test]
fn factorized_adapter_with_wrong_style_width_is_rejected() {
    let mut config = config(FusionMethod::Poe);
    config.factorized_representation = true;
    config.style_dim = 4;
    let adapters: Vec<Box<dyn ModalityAdapter>> =
        vec![Box::new(LinearGaussianAdapter::with_style("a", 6, LATENT_DIM, 3, 1))];
    let err = MultimodalVae::new(config, adapters, Device::Cpu).err().unwrap();
    assert!(matches!(err, FusionError::DimensionMismatch { expected: 4, actual: 3, .. }));
}

#[test]
fn reconstruction_plan_follows_the_method_table() {
    let batch = batch_for(&["a", "b"], 3);
    let all = vec!["a".to_string(), "b".to_string()];

    let poe = source_labels(&linear_vae(FusionMethod::Poe, &["a", "b"]), &batch);
    assert_eq!(
        poe,
        vec![
            ("a".to_string(), vec!["a".to_string()]),
            ("a_b".to_string(), all.clone()),
            ("b".to_string(), vec!["b".to_string()]),
        ]
    );

    let moe = source_labels(&linear_vae(FusionMethod::Moe, &["a", "b"]), &batch);
    assert_eq!(moe, vec![("a".to_string(), all.clone()), ("b".to_string(), all.clone())]);

    let joint_elbo = source_labels(&linear_vae(FusionMethod::JointElbo, &["a", "b"]), &batch);
    let sources: Vec<&str> = joint_elbo.iter().map(|(s, _)| s.as_str()).collect();
    assert_eq!(sources, vec!["a", "a_b", "b"]);
    assert!(joint_elbo.iter().all(|(_, targets)| targets == &all));

    let jsd = source_labels(&linear_vae(FusionMethod::Jsd, &["a", "b"]), &batch);
    assert_eq!(jsd, vec![("joint".to_string(), all.clone())]);

    let pfom = source_labels(&linear_vae(FusionMethod::Pfom, &["a", "b"]), &batch);
    assert_eq!(pfom.len(), 3);
}

#[test]
fn partial_batch_fuses_only_covered_subsets() {
    let vae = linear_vae(FusionMethod::JointElbo, &["a", "b", "c"]);
    let batch = batch_for(&["a", "c"], 4);
    let mut rng = StdRng::seed_from_u64(8);

    let forward = vae.forward(&batch, &mut rng).unwrap();
    assert_eq!(forward.joint_latents.keys().count(), 8, "every key stays in the bundle");
    let fused: BTreeSet<&str> = forward.joint_latents.fused().map(|(k, _)| k.as_str()).collect();
    assert_eq!(fused, ["a", "c", "a_c"].into_iter().collect());
    assert_eq!(forward.enc_mods.len(), 2);

    // Only present modalities are reconstructed.
    for targets in forward.reconstructions.values() {
        assert!(!targets.contains_key("b"));
    }

    let results = ElboDecomposer::new(&vae).compute(forward, &batch, 0).unwrap();
    assert!(results.total_loss_value().unwrap().is_finite());

    let poe = linear_vae(FusionMethod::Poe, &["a", "b", "c"]);
    let forward = poe.forward(&batch, &mut rng).unwrap();
    assert_eq!(forward.joint_latents.joint_subsets(), &[SubsetKey::from("a_c")]);
}

#[test]
fn adapter_errors_propagate_unchanged() {
    let adapters: Vec<Box<dyn ModalityAdapter>> = vec![
        Box::new(LinearGaussianAdapter::new("a", 6, LATENT_DIM, 1)),
        Box::new(FailingAdapter::new("broken", LATENT_DIM)),
    ];
    let vae = MultimodalVae::new(config(FusionMethod::Poe), adapters, Device::Cpu).unwrap();
    let batch = batch_for(&["a", "broken"], 2);
    let mut rng = StdRng::seed_from_u64(0);

    let err = vae.forward(&batch, &mut rng).err().unwrap();
    println!("STATE: error = {}", err);
    assert!(
        matches!(err, FusionError::Adapter { ref modality, .. } if modality == "broken"),
        "expected adapter error from 'broken', got {:?}",
        err
    );
}

#[test]
fn unregistered_modality_in_batch_is_rejected() {
    let vae = linear_vae(FusionMethod::Poe, &["a"]);
    let batch = batch_for(&["a", "z"], 2);
    let mut rng = StdRng::seed_from_u64(0);
    assert!(matches!(
        vae.forward(&batch, &mut rng),
        Err(FusionError::UnregisteredModality(ref m)) if m == "z"
    ));
}

#[test]
fn construction_errors_are_configuration_errors() {
    let mismatched: Vec<Box<dyn ModalityAdapter>> = vec![
        Box::new(LinearGaussianAdapter::new("a", 6, LATENT_DIM, 1)),
        Box::new(LinearGaussianAdapter::new("b", 6, LATENT_DIM + 1, 2)),
    ];
    let err = MultimodalVae::new(config(FusionMethod::Poe), mismatched, Device::Cpu)
        .err()
        .unwrap();
    assert!(err.is_configuration(), "got {:?}", err);

    let none: Vec<Box<dyn ModalityAdapter>> = Vec::new();
    let err = MultimodalVae::new(config(FusionMethod::Poe), none, Device::Cpu)
        .err()
        .unwrap();
    assert!(matches!(err, FusionError::NoModalities));

    let mut weighted = config(FusionMethod::Poe);
    weighted.reconstruction_weights.insert("ghost".into(), 2.0);
    let adapters: Vec<Box<dyn ModalityAdapter>> =
        vec![Box::new(LinearGaussianAdapter::new("a", 6, LATENT_DIM, 1))];
    assert!(MultimodalVae::new(weighted, adapters, Device::Cpu).is_err());
}

/// Encoder whose mean is NaN.
struct NanAdapter;

impl ModalityAdapter for NanAdapter {
    fn name(&self) -> &str {
        "nan"
    }

    fn content_dim(&self) -> usize {
        LATENT_DIM
    }

    fn encode(&self, data: &Tensor) -> FusionResult<EncMod> {
        let batch = data.dims()[0];
        let mu = Tensor::from_vec(vec![f32::NAN; batch * LATENT_DIM], (batch, LATENT_DIM), &Device::Cpu)?;
        let logvar = Tensor::zeros((batch, LATENT_DIM), candle_core::DType::F32, &Device::Cpu)?;
        Ok(EncMod::content_only(Distr::new(mu, logvar)?))
    }

    fn decode(&self, z: &Tensor, _style: Option<&Tensor>) -> FusionResult<Reconstruction> {
        Ok(Reconstruction::new(Likelihood::Bernoulli, z.clone()))
    }

    fn likelihood(&self) -> Likelihood {
        Likelihood::Bernoulli
    }
}

#[test]
fn non_finite_loss_aborts_with_context() {
    let adapters: Vec<Box<dyn ModalityAdapter>> = vec![Box::new(NanAdapter)];
    let vae = MultimodalVae::new(config(FusionMethod::JointElbo), adapters, Device::Cpu).unwrap();
    let batch = ModalityBatch::new().with(
        "nan",
        Tensor::zeros((2, LATENT_DIM), candle_core::DType::F32, &Device::Cpu).unwrap(),
    );
    let mut rng = StdRng::seed_from_u64(0);
    let forward = vae.forward(&batch, &mut rng).unwrap();
    let err = ElboDecomposer::new(&vae).compute(forward, &batch, 0).err().unwrap();
    println!("STATE: error = {}", err);
    match err {
        FusionError::NonFiniteLoss {
            method,
            source_label,
            ..
        } => {
            assert_eq!(method, FusionMethod::JointElbo);
            assert_eq!(source_label, "nan");
        }
        other => panic!("expected NonFiniteLoss, got {:?}", other),
    }
}

#[test]
fn same_seed_reproduces_the_loss() {
    let vae = linear_vae(FusionMethod::PlanarMixture, &["a", "b"]);
    let decomposer = ElboDecomposer::new(&vae);
    let batch = batch_for(&["a", "b"], 4);

    let run = |seed: u64| {
        let mut rng = StdRng::seed_from_u64(seed);
        let forward = vae.forward(&batch, &mut rng).unwrap();
        decomposer
            .compute(forward, &batch, 0)
            .unwrap()
            .total_loss_value()
            .unwrap()
    };
    assert_eq!(run(11), run(11));
}

#[test]
fn train_step_updates_parameters() {
    let vae = linear_vae(FusionMethod::Pfom, &["a", "b"]);
    let decomposer = ElboDecomposer::new(&vae);
    let batch = batch_for(&["a", "b"], 8);
    let vars = vae.trainable_vars();
    assert!(!vars.is_empty());
    let before = vars[0].as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();

    let mut optimizer = SGD::new(vars.clone(), 0.01).unwrap();
    let mut rng = StdRng::seed_from_u64(1);
    for _ in 0..3 {
        let results = train_step(&vae, &decomposer, &mut optimizer, &batch, 0, &mut rng).unwrap();
        assert!(results.total_loss_value().unwrap().is_finite());
    }

    let after = vars[0].as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
    assert_ne!(before, after, "optimizer step must move the encoder weights");
    assert_eq!(optimizer.learning_rate(), 0.01);
}

#[test]
fn run_epoch_aggregates_batches() {
    let vae = linear_vae(FusionMethod::Jsd, &["a", "b"]);
    let decomposer = ElboDecomposer::new(&vae);
    let batches = vec![batch_for(&["a", "b"], 4), batch_for(&["a"], 2)];
    let mut rng = StdRng::seed_from_u64(2);

    let summary = run_epoch(&vae, &decomposer, None::<&mut SGD>, &batches, 5, &mut rng).unwrap();
    assert_eq!(summary.epoch, 5);
    assert_eq!(summary.num_batches, 2);
    assert_eq!(summary.num_samples, 6);
    assert!(summary.total_loss.is_finite());
    assert!(summary.log_probs.contains_key("joint"));

    let json = summary.to_json().unwrap();
    assert!(json.contains("\"joint_divergence\""));
}

#[test]
fn conditional_and_random_generation() {
    let vae = linear_vae(FusionMethod::Poe, &["a", "b"]);
    let mut rng = StdRng::seed_from_u64(4);

    let batch = batch_for(&["a"], 3);
    let generated = vae
        .conditional_generation(&batch, &SubsetKey::from("a"), &mut rng)
        .unwrap();
    assert_eq!(generated.keys().map(String::as_str).collect::<Vec<_>>(), vec!["a", "b"]);
    assert_eq!(generated["b"].params().dims(), &[3, 6]);

    let err = vae
        .conditional_generation(&batch, &SubsetKey::from("a_b"), &mut rng)
        .err()
        .unwrap();
    assert!(matches!(err, FusionError::UnknownSubset(_)));

    let random = vae.random_generation(5, &mut rng).unwrap();
    assert_eq!(random["a"].params().dims(), &[5, 6]);
}

#[test]
fn joint_embedding_accessors_agree_across_variants() {
    let mut rng = StdRng::seed_from_u64(6);
    let batch = batch_for(&["a", "b"], 4);
    for method in [FusionMethod::Poe, FusionMethod::PlanarMixture] {
        let vae = linear_vae(method, &["a", "b"]);
        let forward = vae.forward(&batch, &mut rng).unwrap();
        let latents = &forward.joint_latents;
        let joint = latents.joint_embedding(&mut rng).unwrap();
        let subset = latents.subset_embedding(&SubsetKey::from("a"), &mut rng).unwrap();
        assert_eq!(joint.dims(), &[4, LATENT_DIM]);
        assert_eq!(subset.dims(), &[4, LATENT_DIM]);
        assert!(latents.source(&LatentSource::Joint).is_ok());
        assert!(latents.subset_embedding(&SubsetKey::from("x"), &mut rng).is_err());
    }
}
