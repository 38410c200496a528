//! PowerShell wrappers for Hyper-V commands

use super::shell::{escape_ps, PowerShell};
use super::{Guardian, Hypervisor, KeyProtector};
use crate::config::Timeouts;
use crate::models::{VmSpec, VmState};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// VM information from Hyper-V
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HyperVInfo {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "State")]
    pub state: i32,
    #[serde(rename = "Notes", default)]
    pub notes: Option<String>,
}

impl HyperVInfo {
    pub fn state(&self) -> VmState {
        VmState::from_hyperv_state(self.state)
    }
}

/// Hyper-V operations on the local host
pub struct HyperV {
    shell: PowerShell,
    timeouts: Timeouts,
}

impl HyperV {
    pub fn new(timeouts: Timeouts) -> Result<Self> {
        Ok(Self {
            shell: PowerShell::new(timeouts.command())?,
            timeouts,
        })
    }

    /// Check if the Hyper-V PowerShell module is usable
    pub fn is_available(&self) -> Result<bool> {
        let output = self
            .shell
            .run("Get-Command -Module Hyper-V -Name Get-VM -ErrorAction SilentlyContinue | Measure-Object | Select-Object -ExpandProperty Count")?;
        Ok(output.trim() != "0")
    }

    /// List all VMs
    pub fn list_vms(&self) -> Result<Vec<HyperVInfo>> {
        let output = self
            .shell
            .run("Get-VM | Select-Object Name, State, Notes | ConvertTo-Json -Compress")?;
        parse_vm_list(&output)
    }

    /// Get VM by name
    pub fn get_vm(&self, name: &str) -> Result<Option<HyperVInfo>> {
        let output = self.shell.run(&format!(
            "Get-VM -Name '{}' -ErrorAction SilentlyContinue | Select-Object Name, State, Notes | ConvertTo-Json -Compress",
            escape_ps(name)
        ))?;

        if output.trim().is_empty() {
            return Ok(None);
        }

        Ok(Some(serde_json::from_str(&output)?))
    }
}

impl Hypervisor for HyperV {
    fn list_vm_names(&self) -> Result<Vec<String>> {
        Ok(self.list_vms()?.into_iter().map(|vm| vm.name).collect())
    }

    fn vm_exists(&self, name: &str) -> Result<bool> {
        Ok(self.get_vm(name)?.is_some())
    }

    fn clone_disk(&self, source: &Path, destination: &Path) -> Result<()> {
        self.shell.run_with_timeout(
            &format!(
                "Copy-Item -LiteralPath '{}' -Destination '{}' -Force",
                escape_ps(&source.to_string_lossy()),
                escape_ps(&destination.to_string_lossy())
            ),
            self.timeouts.disk_copy(),
        )?;
        Ok(())
    }

    fn mount_disk(&self, disk: &Path) -> Result<PathBuf> {
        let disk = escape_ps(&disk.to_string_lossy());
        // The largest basic partition is the OS volume; give it a letter if it has none
        let output = self.shell.run(&format!(
            r#"
            Mount-VHD -Path '{disk}'
            try {{
                $part = Get-VHD -Path '{disk}' | Get-Disk | Get-Partition |
                    Where-Object {{ $_.Type -eq 'Basic' }} |
                    Sort-Object Size -Descending | Select-Object -First 1
                if (-not $part) {{ throw 'disk has no basic partition' }}
                if (-not $part.DriveLetter -or $part.DriveLetter -eq [char]0) {{
                    $part | Add-PartitionAccessPath -AssignDriveLetter
                    $part = $part | Get-Partition
                }}
                "$($part.DriveLetter):\"
            }} catch {{
                Dismount-VHD -Path '{disk}' -ErrorAction SilentlyContinue
                throw
            }}
            "#
        ))?;

        let root = output.trim();
        if root.len() < 3 || !root.ends_with(":\\") {
            return Err(Error::Parse(format!("unexpected volume root: {:?}", root)));
        }
        Ok(PathBuf::from(root))
    }

    fn dismount_disk(&self, disk: &Path) -> Result<()> {
        self.shell.run(&format!(
            "Dismount-VHD -Path '{}'",
            escape_ps(&disk.to_string_lossy())
        ))?;
        Ok(())
    }

    fn create_vm(&self, spec: &VmSpec) -> Result<()> {
        let name = escape_ps(&spec.name);
        let mut script = format!(
            r#"
            New-VM -Name '{name}' -MemoryStartupBytes {memory} -Generation 2 -VHDPath '{vhdx}' -SwitchName '{switch}' | Out-Null
            Set-VM -Name '{name}' -ProcessorCount {cpus} -AutomaticCheckpointsEnabled $false
            Set-VMFirmware -VMName '{name}' -EnableSecureBoot On
            Set-VMNetworkAdapter -VMName '{name}' -DeviceNaming On
            "#,
            memory = spec.memory_bytes,
            vhdx = escape_ps(&spec.vhdx_path.to_string_lossy()),
            switch = escape_ps(&spec.switch_name),
            cpus = spec.cpu_count,
        );
        if let Some(vlan) = spec.vlan_id {
            script.push_str(&format!(
                "Set-VMNetworkAdapterVlan -VMName '{}' -Access -VlanId {}\n",
                name, vlan
            ));
        }
        self.shell.run(&script)?;
        Ok(())
    }

    fn ensure_guardian(&self, name: &str) -> Result<Guardian> {
        let name = escape_ps(name);
        let output = self.shell.run(&format!(
            r#"
            Get-HgsGuardian -Name '{name}' -ErrorAction SilentlyContinue | Select-Object -First 1 -OutVariable g | Out-Null
            if (-not $g) {{ $g = New-HgsGuardian -Name '{name}' -GenerateCertificates }}
            @($g)[0].Name
            "#
        ))?;

        let found = output.trim();
        if found.is_empty() {
            return Err(Error::Parse("guardian lookup returned no name".into()));
        }
        Ok(Guardian {
            name: found.to_string(),
        })
    }

    fn new_key_protector(&self, guardian: &Guardian) -> Result<KeyProtector> {
        let output = self.shell.run(&format!(
            r#"
            Get-HgsGuardian -Name '{}' -OutVariable g | Out-Null
            $kp = New-HgsKeyProtector -Owner @($g)[0] -AllowUntrustedRoot
            [Convert]::ToBase64String($kp.RawData)
            "#,
            escape_ps(&guardian.name)
        ))?;
        KeyProtector::from_base64(&output)
    }

    fn set_key_protector(&self, vm: &str, protector: &KeyProtector) -> Result<()> {
        self.shell.run(&format!(
            "Set-VMKeyProtector -VMName '{}' -KeyProtector ([Convert]::FromBase64String('{}'))",
            escape_ps(vm),
            protector.to_base64()
        ))?;
        Ok(())
    }

    fn enable_tpm(&self, vm: &str) -> Result<()> {
        self.shell
            .run(&format!("Enable-VMTPM -VMName '{}'", escape_ps(vm)))?;
        Ok(())
    }

    fn start_vm(&self, vm: &str) -> Result<()> {
        self.shell
            .run(&format!("Start-VM -Name '{}'", escape_ps(vm)))?;
        Ok(())
    }

    fn vm_state(&self, vm: &str) -> Result<VmState> {
        Ok(self
            .get_vm(vm)?
            .map(|info| info.state())
            .unwrap_or(VmState::Unknown))
    }

    fn bios_serial(&self, vm: &str) -> Result<String> {
        let output = self.shell.run(&format!(
            r#"
            Get-CimInstance -Namespace 'root\virtualization\v2' -ClassName Msvm_VirtualSystemSettingData |
                Where-Object {{ $_.ElementName -eq '{}' -and $_.VirtualSystemType -eq 'Microsoft:Hyper-V:System:Realized' }} |
                Select-Object -First 1 -ExpandProperty BIOSSerialNumber
            "#,
            escape_ps(vm)
        ))?;

        let serial = output.trim();
        if serial.is_empty() {
            return Err(Error::Parse(format!("no BIOS serial reported for {}", vm)));
        }
        Ok(serial.to_string())
    }

    fn set_notes(&self, vm: &str, notes: &str) -> Result<()> {
        self.shell.run(&format!(
            "Set-VM -Name '{}' -Notes '{}'",
            escape_ps(vm),
            escape_ps(notes)
        ))?;
        Ok(())
    }
}

/// `ConvertTo-Json` emits a bare object for one VM and an array for several
fn parse_vm_list(output: &str) -> Result<Vec<HyperVInfo>> {
    let output = output.trim();
    if output.is_empty() {
        return Ok(vec![]);
    }

    if output.starts_with('[') {
        Ok(serde_json::from_str(output)?)
    } else {
        let single: HyperVInfo = serde_json::from_str(output)?;
        Ok(vec![single])
    }
}
