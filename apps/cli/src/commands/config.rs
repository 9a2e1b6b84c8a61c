//! 配置文件命令

use anyhow::{Context, Result};
use clap::Subcommand;
use std::fs;
use std::path::{Path, PathBuf};

use crate::rig::RigConfig;

/// 配置命令
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// 输出带默认值的配置模板
    Template {
        /// 写入文件（缺省输出到标准输出）
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// 覆盖已存在的文件
        #[arg(long)]
        force: bool,
    },

    /// 检查配置文件
    Check {
        /// 配置文件路径
        file: PathBuf,
    },
}

impl ConfigCommand {
    pub fn execute(self) -> Result<()> {
        match self {
            ConfigCommand::Template { output, force } => Self::template_(output.as_deref(), force),
            ConfigCommand::Check { file } => Self::check_(&file),
        }
    }

    fn template_(output: Option<&Path>, force: bool) -> Result<()> {
        let text = RigConfig::template()?;
        match output {
            Some(path) => {
                if path.exists() && !force {
                    anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
                }
                fs::write(path, text).with_context(|| format!("cannot write {}", path.display()))?;
                println!("✅ Wrote {}", path.display());
            },
            None => print!("{}", text),
        }
        Ok(())
    }

    fn check_(file: &Path) -> Result<()> {
        let config = RigConfig::load(file)?;
        println!("✅ {} is valid", file.display());
        for line in summary(&config) {
            println!("  {}", line);
        }
        Ok(())
    }
}

/// 配置摘要
pub fn summary(config: &RigConfig) -> Vec<String> {
    let pins = config
        .pendule
        .pins
        .assigned()
        .into_iter()
        .map(|(name, pin)| format!("{}={}", name, pin))
        .collect::<Vec<_>>()
        .join(" ");
    let physics = &config.pendule.physics;
    let limits = &config.pendule.limits;
    let server = &config.server;

    vec![
        format!("Pins: {}", pins),
        format!(
            "Track: {} m, {:.3e} m/step, {:.3e} rad/step",
            physics.track_length, physics.meters_per_step, physics.radians_per_step
        ),
        format!(
            "Limits: max power {}, hard margin {} m, soft margin {} m",
            limits.max_power, limits.hard_margin, limits.soft_margin
        ),
        format!(
            "Server: {} state/udp {} command/tcp {}, publish every {} ms",
            server.host, server.state_port, server.command_port, server.publish_period_ms
        ),
        match server.command_watchdog() {
            Some(timeout) => format!("Watchdog: {} ms", timeout.as_millis()),
            None => "Watchdog: off".to_string(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rig.toml");

        ConfigCommand::Template {
            output: Some(path.clone()),
            force: false,
        }
        .execute()
        .unwrap();
        RigConfig::load(&path).unwrap();

        let err = ConfigCommand::Template {
            output: Some(path.clone()),
            force: false,
        }
        .execute()
        .unwrap_err();
        assert!(err.to_string().contains("already exists"), "{}", err);

        ConfigCommand::Template {
            output: Some(path),
            force: true,
        }
        .execute()
        .unwrap();
    }

    #[test]
    fn test_check_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rig.toml");
        fs::write(
            &path,
            "[pins]\nmotor_pwm = 17\nleft_switch = 17\nright_switch = 18\n\
             position_encoder_a = 20\nangle_encoder_a = 19\n",
        )
        .unwrap();
        let err = ConfigCommand::Check { file: path }.execute().unwrap_err();
        assert!(format!("{:#}", err).contains("left_switch"), "{:#}", err);
    }

    #[test]
    fn test_summary_mentions_watchdog() {
        let mut config = RigConfig::default();
        let lines = summary(&config);
        assert!(lines.iter().any(|l| l == "Watchdog: 1000 ms"), "{:?}", lines);
        assert!(lines[0].contains("motor_pwm=24"), "{:?}", lines);

        config.server.command_watchdog_ms = 0;
        assert!(summary(&config).iter().any(|l| l == "Watchdog: off"));
    }
}
