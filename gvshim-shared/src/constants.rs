//! Shared constants between the shim and its clients.

/// Container bundle layout
pub mod bundle {
    /// Directory inside the bundle that receives the rootfs mounts
    pub const ROOTFS_DIR: &str = "rootfs";

    /// OCI runtime spec file inside the bundle
    pub const CONFIG_FILE: &str = "config.json";

    /// Pid file written by `runsc create` for the init process
    pub const INIT_PID_FILE: &str = "init.pid";
}

/// Event stream constants
pub mod events {
    /// Capacity of the outbound event queue.
    ///
    /// Once full, producers wait for the forwarder to drain it.
    pub const QUEUE_CAPACITY: usize = 128;
}

/// Event topics, as understood by containerd
pub mod topics {
    pub const TASK_CREATE: &str = "/tasks/create";
    pub const TASK_START: &str = "/tasks/start";
    pub const TASK_OOM: &str = "/tasks/oom";
    pub const TASK_EXIT: &str = "/tasks/exit";
    pub const TASK_DELETE: &str = "/tasks/delete";
    pub const TASK_EXEC_ADDED: &str = "/tasks/exec-added";
    pub const TASK_EXEC_STARTED: &str = "/tasks/exec-started";
    pub const TASK_UNKNOWN: &str = "/tasks/?";
}

/// Process exit constants
pub mod exit {
    /// Status reported when the real exit status could not be collected
    pub const UNKNOWN_STATUS: i32 = 255;
}

/// Annotations read from the OCI spec
pub mod annotations {
    /// CRI annotation naming the container type
    pub const CONTAINER_TYPE: &str = "io.kubernetes.cri.container-type";

    /// Value of [`CONTAINER_TYPE`] for the pod sandbox container
    pub const CONTAINER_TYPE_SANDBOX: &str = "sandbox";
}
