use std::collections::HashMap;
use std::fs;
use std::path::{
  Path,
  PathBuf
};

use anyhow::{
  Context,
  anyhow
};
use tracing::{
  debug,
  info,
  trace,
  warn
};

use crate::datetime::{
  format_minutes,
  parse_clock_minutes
};

const DEFAULTS: &[(&str, &str)] = &[
  ("data.location", "~/.daybook"),
  ("color", "on"),
  ("notify.enabled", "on"),
  ("notify.event.default", "none"),
  (
    "notify.reminder.default",
    "none"
  ),
  ("notify.lookahead.days", "30"),
  ("notify.grace.minutes", "5"),
  ("notify.default.time", "09:00"),
  (
    "notify.icon",
    "x-office-calendar"
  ),
  ("notify.rollover.seconds", "30"),
  ("events.past.days", "30")
];

#[derive(Debug, Clone)]
pub struct Config {
  map: HashMap<String, String>,
  pub loaded_files: Vec<PathBuf>
}

impl Default for Config {
  fn default() -> Self {
    Self::defaults()
  }
}

impl Config {
  /// Built-in values only, no rc
  /// file.
  pub fn defaults() -> Self {
    Config {
      map:          DEFAULTS
        .iter()
        .map(|(k, v)| {
          (
            (*k).to_string(),
            (*v).to_string()
          )
        })
        .collect(),
      loaded_files: vec![]
    }
  }

  #[tracing::instrument(skip(
    rc_override
  ))]
  pub fn load(
    rc_override: Option<&Path>
  ) -> anyhow::Result<Self> {
    let mut cfg = Config::defaults();

    let rc = resolve_rc_path(
      rc_override
    )?;
    if let Some(path) = rc {
      info!(rc = %path.display(), "loading daybookrc");
      cfg.load_file(&path)?;
    } else {
      debug!(
        "no daybookrc found; using \
         defaults"
      );
    }

    Ok(cfg)
  }

  #[tracing::instrument(skip(
    self, overrides
  ))]
  pub fn apply_overrides<I>(
    &mut self,
    overrides: I
  ) where
    I: IntoIterator<
      Item = (String, String)
    >
  {
    for (k, v) in overrides {
      let key = k
        .strip_prefix("rc.")
        .unwrap_or(&k)
        .to_string();
      debug!(key = %key, value = %v, "applying override");
      self.map.insert(key, v);
    }
  }

  pub fn get(
    &self,
    key: &str
  ) -> Option<String> {
    self.map.get(key).cloned()
  }

  pub fn get_bool(
    &self,
    key: &str
  ) -> Option<bool> {
    self
      .map
      .get(key)
      .map(|v| parse_bool(v))
  }

  /// Unsigned value of `key`;
  /// unparseable values fall back to
  /// `default` with a warning.
  pub fn get_u64(
    &self,
    key: &str,
    default: u64
  ) -> u64 {
    match self.map.get(key) {
      | None => default,
      | Some(raw) => {
        match raw.trim().parse::<u64>()
        {
          | Ok(value) => value,
          | Err(_) => {
            warn!(
              key,
              value = %raw,
              default,
              "config value is not a \
               number; using default"
            );
            default
          }
        }
      }
    }
  }

  /// [`Config::get_u64`] capped at
  /// `max`.
  pub fn get_bounded(
    &self,
    key: &str,
    default: u64,
    max: u64
  ) -> u64 {
    let value =
      self.get_u64(key, default);
    if value > max {
      warn!(
        key,
        value,
        max,
        "config value too large; \
         capping"
      );
      max
    } else {
      value
    }
  }

  /// Day count of `key` as a signed
  /// span, capped at `max`.
  pub fn get_days(
    &self,
    key: &str,
    default: u64,
    max: u64
  ) -> i64 {
    i64::try_from(
      self.get_bounded(key, default, max)
    )
    .unwrap_or(i64::MAX)
  }

  /// Clock time of `key` in minutes
  /// past midnight; unparseable values
  /// fall back to `default` with a
  /// warning.
  pub fn get_clock_minutes(
    &self,
    key: &str,
    default: u32
  ) -> u32 {
    match self.map.get(key) {
      | None => default,
      | Some(raw) => {
        match parse_clock_minutes(raw) {
          | Some(minutes) => minutes,
          | None => {
            warn!(
              key,
              value = %raw,
              default = %format_minutes(default),
              "config value is not a \
               clock time; using default"
            );
            default
          }
        }
      }
    }
  }

  pub fn iter(
    &self
  ) -> impl Iterator<Item = (&String, &String)>
  {
    self.map.iter()
  }

  #[tracing::instrument(skip(self))]
  fn load_file(
    &mut self,
    path: &Path
  ) -> anyhow::Result<()> {
    let path = expand_tilde(path);
    if self.loaded_files.contains(&path)
    {
      warn!(
        file = %path.display(),
        "rc file already loaded; \
         skipping include cycle"
      );
      return Ok(());
    }
    let text =
      fs::read_to_string(&path)
        .with_context(|| {
          format!(
            "failed to read {}",
            path.display()
          )
        })?;

    self
      .loaded_files
      .push(path.clone());

    let base_dir = path
      .parent()
      .map(|p| p.to_path_buf())
      .unwrap_or_else(|| {
        PathBuf::from(".")
      });

    for (line_num, raw_line) in
      text.lines().enumerate()
    {
      let line = strip_comment(raw_line);
      if line.is_empty() {
        continue;
      }

      if let Some(include_rest) =
        line.strip_prefix("include ")
      {
        let include_path =
          resolve_include_path(
            &base_dir,
            include_rest.trim()
          )?;
        debug!(
            file = %path.display(),
            include = %include_path.display(),
            line = line_num + 1,
            "processing include"
        );

        if include_path.exists() {
          self
            .load_file(&include_path)?;
        } else {
          warn!(include = %include_path.display(), "include file does not exist; skipping");
        }
        continue;
      }

      let (k, v) = line
        .split_once('=')
        .ok_or_else(|| {
          anyhow!(
            "invalid config line \
             {}:{}: {}",
            path.display(),
            line_num + 1,
            raw_line
          )
        })?;

      let key = k.trim().to_string();
      let value = v.trim().to_string();
      if !is_known_key(&key) {
        warn!(
          key = %key,
          file = %path.display(),
          line = line_num + 1,
          "unknown config key"
        );
      }
      trace!(key = %key, value = %value, "loaded config key");
      self.map.insert(key, value);
    }

    Ok(())
  }
}

fn is_known_key(
  key: &str
) -> bool {
  DEFAULTS
    .iter()
    .any(|(known, _)| *known == key)
}

#[tracing::instrument(skip(
  cfg,
  override_dir
))]
pub fn resolve_data_dir(
  cfg: &Config,
  override_dir: Option<&Path>
) -> anyhow::Result<PathBuf> {
  let dir = if let Some(path) =
    override_dir
  {
    path.to_path_buf()
  } else if let Some(cfg_value) =
    cfg.get("data.location")
  {
    expand_tilde(Path::new(&cfg_value))
  } else {
    default_data_dir()?
  };

  if !dir.exists() {
    info!(dir = %dir.display(), "creating data directory");
    fs::create_dir_all(&dir)
      .with_context(|| {
        format!(
          "failed to create {}",
          dir.display()
        )
      })?;
  }

  Ok(dir)
}

#[tracing::instrument(skip(
  override_path
))]
fn resolve_rc_path(
  override_path: Option<&Path>
) -> anyhow::Result<Option<PathBuf>> {
  if let Some(path) = override_path {
    return Ok(Some(path.to_path_buf()));
  }

  if let Ok(rc_env) =
    std::env::var("DAYBOOKRC")
  {
    if rc_env == "/dev/null" {
      return Ok(None);
    }
    return Ok(Some(PathBuf::from(
      rc_env
    )));
  }

  let Some(home) = dirs::home_dir()
  else {
    warn!(
      "cannot determine home \
       directory; skipping \
       ~/.daybookrc"
    );
    return Ok(None);
  };
  let candidate =
    home.join(".daybookrc");
  if candidate.exists() {
    return Ok(Some(candidate));
  }

  Ok(None)
}

fn default_data_dir()
-> anyhow::Result<PathBuf> {
  let home = dirs::home_dir()
    .ok_or_else(|| {
      anyhow!(
        "cannot determine home \
         directory"
      )
    })?;
  Ok(home.join(".daybook"))
}

fn strip_comment(
  raw_line: &str
) -> &str {
  let line = raw_line.trim();
  match line.split_once('#') {
    | Some((before, _)) => before.trim(),
    | None => line
  }
}

fn resolve_include_path(
  base_dir: &Path,
  include: &str
) -> anyhow::Result<PathBuf> {
  if include.trim().is_empty() {
    return Err(anyhow!(
      "include path cannot be empty"
    ));
  }

  let raw = PathBuf::from(include);
  let expanded = expand_tilde(&raw);
  if expanded.is_absolute() {
    Ok(expanded)
  } else {
    Ok(base_dir.join(expanded))
  }
}

fn expand_tilde(
  path: &Path
) -> PathBuf {
  let text = path.to_string_lossy();
  if let Some(rest) =
    text.strip_prefix("~/")
    && let Some(home) = dirs::home_dir()
  {
    return home.join(rest);
  }
  path.to_path_buf()
}

fn parse_bool(s: &str) -> bool {
  matches!(
    s.trim()
      .to_ascii_lowercase()
      .as_str(),
    "1" | "y" | "yes" | "on" | "true"
  )
}
