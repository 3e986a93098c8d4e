use std::path::PathBuf;
use std::time::Duration;

use log::*;
use nix::errno::Errno;

use crate::host::cage::CageId;
use crate::host::context::ThreadContext;
use crate::host::descriptor::{Descriptor, FileHandle, PATH_MAX};
use crate::host::syscall::handler::SyscallHandler;
use crate::host::syscall::types::{SyscallArgs, SyscallResult, UserPtr};
use crate::host::thread::UserContext;

/// The wait-any pid values.
const WAIT_ANY: i64 = -1;
const WAIT_ANY_PG: i64 = 0;

/// How long waitpid dwells on one child before rotating to the next.
const WAIT_ROTATION: Duration = Duration::from_secs(1);

impl SyscallHandler {
    pub fn exit(&self, ctx: &mut ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let status = i32::from(args.get(0));

        debug!("cage {} exit({})", ctx.cage.id(), status);
        ctx.cage.report_exit(status);
        // the caller returns into the launcher, which tears the thread down
        Ok(0u32.into())
    }

    /// Create a child cage continuing from the caller's captured context.
    /// The parent sees the child id; the child sees zero.
    pub fn fork(&self, ctx: &mut ThreadContext, _args: &SyscallArgs) -> SyscallResult {
        let parent = ctx.cage;
        let runtime = ctx.runtime;

        parent.begin_fork()?;
        let result = (|| -> Result<CageId, Errno> {
            let fork_num = runtime.bump_fork_counter();
            debug!("fork {} from cage {}", fork_num, parent.id());

            let parent_ctx = ctx.thread.user_ctx();
            let module = parent.module().ok_or(Errno::EINVAL)?;

            let snapshot = runtime.execution_copier().snapshot(parent)?;
            let child = runtime
                .create_cage(Some(parent.id()))
                .map_err(|_| Errno::ENOMEM)?;

            // the child starts from the parent's descriptor table; shared
            // file objects, independent fd numbering from here on
            *child.descriptors() = parent.descriptors().clone_for_fork();

            runtime.execution_copier().install(&child, &snapshot)?;
            child.set_module(module.clone());
            if let Some(path) = parent.binary_path() {
                child.set_binary_path(path);
            }
            child.set_cwd(parent.cwd());

            runtime.register_cage(&child, Some(parent));
            child.set_running();

            let child_ctx = UserContext::for_fork_child(&parent_ctx);
            let entry = module.forked_entry(child_ctx.clone());
            runtime.launch_thread(&child, entry, Some(child_ctx))?;

            Ok(child.id())
        })();
        parent.end_fork();

        let child_id = result?;
        debug!("fork: cage {} begat cage {}", parent.id(), child_id);
        Ok(u32::from(child_id).into())
    }

    pub fn execve(&self, ctx: &mut ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let path_ptr = UserPtr::from(args.get(0));
        let argv_ptr = UserPtr::from(args.get(1));
        let _envp = UserPtr::from(args.get(2));

        self.exec_common(ctx, path_ptr, argv_ptr)
    }

    /// The two-argument form of exec replacement.
    pub fn execv(&self, ctx: &mut ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let path_ptr = UserPtr::from(args.get(0));
        let argv_ptr = UserPtr::from(args.get(1));

        self.exec_common(ctx, path_ptr, argv_ptr)
    }

    // Replace the calling cage with a fresh one running `path`. Returns
    // only on failure; on success the caller's cage reports its exit and
    // the calling thread unwinds into teardown.
    fn exec_common(
        &self,
        ctx: &mut ThreadContext,
        path_ptr: UserPtr,
        argv_ptr: UserPtr,
    ) -> SyscallResult {
        let caller = ctx.cage;
        let runtime = ctx.runtime;

        let path = caller.mem().copy_path_from_user(path_ptr, PATH_MAX)?;
        let raw_argv = if argv_ptr.is_null() {
            String::new()
        } else {
            caller.mem().copy_path_from_user(argv_ptr, PATH_MAX)?
        };

        // canonical child command line: runtime name, loader search path,
        // then the program and its arguments
        let mut argv = vec![
            "AviaryMain".to_string(),
            "--library-path".to_string(),
            "/glibc".to_string(),
            path.clone(),
        ];
        argv.extend(raw_argv.split_whitespace().skip(1).map(str::to_string));

        debug!("cage {} execve {:?}", caller.id(), path);

        let heir = runtime.create_cage(None).map_err(|_| Errno::ENOMEM)?;
        runtime
            .load_and_launch(&heir, None, &PathBuf::from(&path), argv)
            .map_err(|e| {
                warn!("execve: replacement failed: {}", e);
                Errno::ENOENT
            })?;

        // the heir takes over the caller's children
        for child_id in caller.children() {
            if let Some(child) = runtime.cage(child_id) {
                child.set_parent_id(Some(heir.id()));
            }
        }
        caller.transfer_children_to(&heir);

        caller.report_exit(0);
        Ok(0u32.into())
    }

    pub fn waitpid(&self, ctx: &mut ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let pid = i64::from(args.get(0));
        let stat_loc = UserPtr::from(args.get(1));
        let options = u32::from(args.get(2));

        trace!("waitpid({}, {:p}, {})", pid, stat_loc, options);

        // fail on a bad pointer before blocking
        ctx.cage
            .mem()
            .user_to_sys_range(stat_loc, std::mem::size_of::<i32>())?;

        let status = self.wait_for_child(ctx, pid)?;
        ctx.cage.mem().write_val(stat_loc, &status)?;
        Ok((status as u32).into())
    }

    pub fn wait(&self, ctx: &mut ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let stat_loc = UserPtr::from(args.get(0));

        ctx.cage
            .mem()
            .user_to_sys_range(stat_loc, std::mem::size_of::<i32>())?;

        let status = self.wait_for_child(ctx, WAIT_ANY)?;
        ctx.cage.mem().write_val(stat_loc, &status)?;
        Ok((status as u32).into())
    }

    fn wait_for_child(&self, ctx: &ThreadContext, pid: i64) -> Result<i32, Errno> {
        let cage = ctx.cage;
        let runtime = ctx.runtime;

        if cage.num_children() == 0 {
            return Ok(0);
        }

        if pid > 0 {
            if pid > u32::MAX as i64 {
                return Err(Errno::ECHILD);
            }
            let child_id = CageId::new(pid as u32);
            if !cage.children().contains(&child_id) {
                return Err(Errno::ECHILD);
            }
            let child = runtime.cage(child_id).ok_or(Errno::ECHILD)?;
            child.wait_exit(None);
            return runtime.reap_child(cage, &child).ok_or(Errno::ECHILD);
        }
        if pid != WAIT_ANY && pid != WAIT_ANY_PG {
            // process-group waits are not modeled
            return Err(Errno::EINVAL);
        }

        // rotate across the children, dwelling a moment on each, until one
        // of them exits
        loop {
            let children = cage.children();
            if children.is_empty() {
                return Ok(0);
            }
            for child_id in children {
                let Some(child) = runtime.cage(child_id) else {
                    cage.remove_child(child_id);
                    continue;
                };
                if child.wait_exit(Some(WAIT_ROTATION)).is_some() {
                    if let Some(status) = runtime.reap_child(cage, &child) {
                        return Ok(status);
                    }
                    // someone else reaped it first; keep rotating
                }
            }
        }
    }

    /// Read or replace the cage's name-service capability.
    pub fn name_service(&self, ctx: &mut ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let desc_ptr = UserPtr::from(args.get(0));

        let desc_in: i32 = ctx.cage.mem().read_val(desc_ptr).map_err(|_| {
            debug!("invalid address argument to name_service");
            Errno::EFAULT
        })?;

        if desc_in == -1 {
            // read: hand out a fresh descriptor for the capability
            let cap = ctx.cage.name_service();
            if cap.is_invalid() {
                return Err(Errno::ENOENT.into());
            }
            let fd = ctx.cage.descriptors().add(Descriptor::new(cap), 0) as i32;
            ctx.cage.mem().write_val(desc_ptr, &fd)?;
        } else {
            // write: install a new capability
            let file = Self::get_file(ctx.cage, desc_in)?;
            if !matches!(file, FileHandle::ConnCap(_)) {
                return Err(Errno::EINVAL.into());
            }
            ctx.cage.set_name_service(file);
        }
        Ok(0u32.into())
    }
}
