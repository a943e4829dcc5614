//! Starter workspaces

use crate::workspace::{FileRecord, Result, Workspace};

pub struct TemplateFile {
    pub name: &'static str,
    pub content: &'static str,
}

pub struct Template {
    pub name: &'static str,
    pub description: &'static str,
    pub files: &'static [TemplateFile],
}

pub const TEMPLATES: &[Template] = &[
    Template {
        name: "python",
        description: "Python script",
        files: &[TemplateFile {
            name: "main.py",
            content: "import math\n\ndef check_engine():\n    print(f\"PI Precision: {math.pi}\")\n    print(\"All Python cores active.\")\n\ncheck_engine()\n",
        }],
    },
    Template {
        name: "discord",
        description: "Discord bot skeleton (Node.js)",
        files: &[TemplateFile {
            name: "bot.js",
            content: "console.log(\"Discord Gateway: Connecting...\");\nconsole.log(\"Logged in as HubBot#1337\");\nconsole.log(\"Status: Listening for commands\");\n",
        }],
    },
    Template {
        name: "minecraft",
        description: "Bukkit plugin skeleton (Java)",
        files: &[
            TemplateFile {
                name: "HubPlugin.java",
                content: "package com.li.hub;\n\nimport org.bukkit.plugin.java.JavaPlugin;\n\npublic class HubPlugin extends JavaPlugin {\n    @Override\n    public void onEnable() {\n        getLogger().info(\"Plugin Enabled!\");\n    }\n}\n",
            },
            TemplateFile {
                name: "plugin.yml",
                content: "name: HubPlugin\nversion: 1.0.0\nmain: com.li.hub.HubPlugin\napi-version: 1.20\n",
            },
        ],
    },
    Template {
        name: "web",
        description: "Static web page",
        files: &[TemplateFile {
            name: "index.html",
            content: "<!DOCTYPE html>\n<html>\n<body>\n  <h1 style=\"color: #6366f1;\">Workspace Online</h1>\n</body>\n</html>\n",
        }],
    },
];

/// Look up a template by name, ignoring case
pub fn find(name: &str) -> Option<&'static Template> {
    TEMPLATES
        .iter()
        .find(|t| t.name.eq_ignore_ascii_case(name.trim()))
}

/// Write a template's files into the workspace, overwriting same-named files
pub async fn instantiate(template: &Template, workspace: &Workspace) -> Result<Vec<FileRecord>> {
    let mut created = Vec::with_capacity(template.files.len());
    for file in template.files {
        workspace.write(file.name, file.content).await?;
        created.push(FileRecord::new(file.name, file.content));
    }
    Ok(created)
}
