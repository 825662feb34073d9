use image::{Rgb, RgbImage};
use std::path::{Path, PathBuf};

/// Writes `rows` annotated posters under `root/data` and a config pointing at them.
pub fn write_project(root: &Path, rows: usize) -> PathBuf {
    let data = root.join("data");
    let images = data.join("train-jpg");
    std::fs::create_dir_all(&images).unwrap();
    let mut csv = String::from("image_name,tags\n");
    for i in 0..rows {
        let (tags, color) = match i % 4 {
            0 => ("action", [200, 40, 40]),
            1 => ("drama", [40, 40, 200]),
            2 => ("action drama", [200, 40, 200]),
            _ => ("", [30, 30, 30]),
        };
        csv.push_str(&format!("poster_{i},{tags}\n"));
        RgbImage::from_pixel(10, 14, Rgb(color)).save(images.join(format!("poster_{i}.jpg"))).unwrap();
    }
    std::fs::write(data.join("train_classes.csv"), csv).unwrap();

    let config = format!(
        r"
project_name: posters
experiment_name: cli
n_epochs: 2
num_classes: 2
monitor_metric: val_f1
monitor_mode: max
experiments_dir: {experiments}
model_kwargs:
  model_name: linear
  pool: 2
optimizer: sgd
optimizer_kwargs:
  lr: 0.1
scheduler: torch.optim.lr_scheduler.StepLR
scheduler_kwargs:
  step_size: 1
  gamma: 0.5
losses:
  - name: bce
    weight: 1.0
    loss_fn: torch.nn.BCEWithLogitsLoss
data_config:
  data_path: {data}
  batch_size: 4
  n_workers: 0
  train_size: 0.8
  width: 8
  height: 8
",
        experiments = root.join("experiments").display(),
        data = data.display(),
    );
    let path = root.join("config.yaml");
    std::fs::write(&path, config).unwrap();
    path
}
